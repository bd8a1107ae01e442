use refine_smt::SolverConfig;
use serde::Deserialize;

use crate::errors::VerifyError;

/// Verifier settings.
///
/// ```toml
/// check_each_var = true
///
/// [solver]
/// backend = "z3"
/// timeout_ms = 30000
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Compare every named instruction, not only return values.
    pub check_each_var: bool,
    pub solver: SolverConfig,
}

impl VerifyConfig {
    pub fn from_toml_str(src: &str) -> Result<Self, VerifyError> {
        toml::from_str(src).map_err(|e| VerifyError::Config(e.to_string()))
    }

    /// Apply `REFINE_CHECK_EACH_VAR` and the solver's `REFINE_SMT_*`
    /// environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, VerifyError> {
        let mut cfg = self.with_overrides(|key| std::env::var(key).ok())?;
        cfg.solver = cfg.solver.with_env_overrides()?;
        Ok(cfg)
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, VerifyError> {
        if let Some(v) = var("REFINE_CHECK_EACH_VAR") {
            self.check_each_var = match v.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                other => {
                    return Err(VerifyError::Config(format!(
                        "REFINE_CHECK_EACH_VAR: expected a boolean, got `{other}`"
                    )));
                }
            };
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refine_smt::BackendKind;

    #[test]
    fn parses_nested_solver_table() {
        let cfg = VerifyConfig::from_toml_str(
            "check_each_var = true\n[solver]\nbackend = \"z3\"\ntimeout_ms = 30000\n",
        )
        .unwrap();
        assert!(cfg.check_each_var);
        assert_eq!(cfg.solver.backend, BackendKind::Z3);
        assert_eq!(cfg.solver.timeout_ms, 30_000);
        assert_eq!(cfg.solver.max_enum_bits, SolverConfig::default().max_enum_bits);
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(VerifyConfig::from_toml_str("").unwrap(), VerifyConfig::default());
        assert!(VerifyConfig::from_toml_str("check_each_var = 3").is_err());
    }

    #[test]
    fn check_each_var_override() {
        let on = VerifyConfig::default()
            .with_overrides(|k| (k == "REFINE_CHECK_EACH_VAR").then(|| "yes".to_string()))
            .unwrap();
        assert!(on.check_each_var);
        let bad = VerifyConfig::default()
            .with_overrides(|k| (k == "REFINE_CHECK_EACH_VAR").then(|| "maybe".to_string()));
        assert!(matches!(bad, Err(VerifyError::Config(_))));
    }
}
