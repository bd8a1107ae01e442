mod enumerate;
#[cfg(feature = "z3")]
mod z3_backend;

pub use enumerate::EnumerationBackend;
#[cfg(feature = "z3")]
pub use z3_backend::Z3Backend;
