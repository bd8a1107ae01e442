use std::time::Duration;

use serde::Deserialize;

use crate::error::SmtError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Built-in exhaustive search; always available.
    Enumerate,
    /// Z3, when built with `--features z3`.
    Z3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtProfile {
    /// Low timeouts, small search spaces.
    Fast,
    /// CI-friendly medium timeouts.
    Ci,
    /// Higher timeouts and search budgets.
    Thorough,
}

/// Solver session settings.
///
/// Loaded from TOML (`[solver]` table or bare keys) and overridable through
/// `REFINE_SMT_BACKEND`, `REFINE_SMT_TIMEOUT_MS` and `REFINE_SMT_MAX_BITS`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub backend: BackendKind,
    /// Per-check timeout in milliseconds; `0` disables it.
    pub timeout_ms: u64,
    /// Largest number of free-variable bits the enumeration backend searches.
    pub max_enum_bits: u32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self::for_profile(SmtProfile::Ci)
    }
}

impl SolverConfig {
    pub fn for_profile(profile: SmtProfile) -> Self {
        let (timeout_ms, max_enum_bits) = match profile {
            SmtProfile::Fast => (1_000, 16),
            SmtProfile::Ci => (10_000, 20),
            SmtProfile::Thorough => (60_000, 24),
        };
        Self {
            backend: BackendKind::Enumerate,
            timeout_ms,
            max_enum_bits,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn from_toml_str(src: &str) -> Result<Self, SmtError> {
        toml::from_str(src).map_err(|e| SmtError::Config(e.to_string()))
    }

    /// Apply `REFINE_SMT_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, SmtError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, SmtError> {
        if let Some(v) = var("REFINE_SMT_BACKEND") {
            self.backend = match v.trim().to_ascii_lowercase().as_str() {
                "enumerate" => BackendKind::Enumerate,
                "z3" => BackendKind::Z3,
                other => {
                    return Err(SmtError::Config(format!(
                        "REFINE_SMT_BACKEND: unknown backend `{other}`"
                    )));
                }
            };
        }
        if let Some(v) = var("REFINE_SMT_TIMEOUT_MS") {
            self.timeout_ms = v
                .trim()
                .parse()
                .map_err(|e| SmtError::Config(format!("REFINE_SMT_TIMEOUT_MS: {e}")))?;
        }
        if let Some(v) = var("REFINE_SMT_MAX_BITS") {
            self.max_enum_bits = v
                .trim()
                .parse()
                .map_err(|e| SmtError::Config(format!("REFINE_SMT_MAX_BITS: {e}")))?;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_scale_budgets() {
        let fast = SolverConfig::for_profile(SmtProfile::Fast);
        let thorough = SolverConfig::for_profile(SmtProfile::Thorough);
        assert!(fast.timeout_ms < thorough.timeout_ms);
        assert!(fast.max_enum_bits < thorough.max_enum_bits);
        assert_eq!(SolverConfig::default(), SolverConfig::for_profile(SmtProfile::Ci));
    }

    #[test]
    fn toml_fills_missing_keys_from_defaults() {
        let cfg = SolverConfig::from_toml_str("backend = \"z3\"\ntimeout_ms = 0\n").unwrap();
        assert_eq!(cfg.backend, BackendKind::Z3);
        assert_eq!(cfg.timeout(), None);
        assert_eq!(cfg.max_enum_bits, SolverConfig::default().max_enum_bits);
    }

    #[test]
    fn toml_rejects_unknown_backend() {
        let err = SolverConfig::from_toml_str("backend = \"cvc9\"").unwrap_err();
        assert!(matches!(err, SmtError::Config(_)));
    }

    #[test]
    fn overrides_replace_fields() {
        let cfg = SolverConfig::default()
            .with_overrides(|k| match k {
                "REFINE_SMT_TIMEOUT_MS" => Some("250".into()),
                "REFINE_SMT_MAX_BITS" => Some(" 12 ".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(cfg.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(cfg.max_enum_bits, 12);

        let bad = SolverConfig::default().with_overrides(|k| {
            (k == "REFINE_SMT_BACKEND").then(|| "yices".to_string())
        });
        assert!(bad.is_err());
    }
}
