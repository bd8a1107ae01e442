/// SMT sorts a [`Term`](crate::Term) can have.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Sort {
    Bool,
    BitVec(u32),
}

impl Sort {
    pub fn is_bool(self) -> bool {
        matches!(self, Sort::Bool)
    }

    pub fn is_bv(self) -> bool {
        matches!(self, Sort::BitVec(_))
    }

    /// Width in bits; booleans count as one bit when enumerating assignments.
    pub fn bit_len(self) -> u32 {
        match self {
            Sort::Bool => 1,
            Sort::BitVec(w) => w,
        }
    }
}

impl std::fmt::Display for Sort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sort::Bool => write!(f, "Bool"),
            Sort::BitVec(w) => write!(f, "(_ BitVec {w})"),
        }
    }
}
