//! Snapshot of which execution strategies are usable on this host.
//!
//! A `CapabilityMatrix` is produced by the prober and never mutated afterwards.
//! Tests build arbitrary matrices directly with [`CapabilityMatrix::new`] and
//! [`CapabilityMatrix::with_language`].

use crate::languages::Language;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageCapability {
    pub image_ready: bool,
    pub native_available: bool,
}

/// Which strategies the dispatcher may try for one language
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyPlan {
    /// Try the container first; fall back to native only if `native_fallback`.
    Isolated { native_fallback: bool },
    Native,
    Unavailable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityMatrix {
    isolation_available: bool,
    languages: BTreeMap<Language, LanguageCapability>,
}

impl CapabilityMatrix {
    pub fn new(isolation_available: bool) -> Self {
        Self {
            isolation_available,
            languages: BTreeMap::new(),
        }
    }

    pub fn with_language(
        mut self,
        language: Language,
        image_ready: bool,
        native_available: bool,
    ) -> Self {
        self.languages.insert(
            language,
            LanguageCapability {
                image_ready,
                native_available,
            },
        );
        self
    }

    pub fn isolation_available(&self) -> bool {
        self.isolation_available
    }

    pub fn capability(&self, language: Language) -> LanguageCapability {
        self.languages.get(&language).copied().unwrap_or_default()
    }

    pub fn can_isolate(&self, language: Language) -> bool {
        self.isolation_available && self.capability(language).image_ready
    }

    pub fn can_run_natively(&self, language: Language) -> bool {
        self.capability(language).native_available
    }

    pub fn is_executable(&self, language: Language) -> bool {
        self.can_isolate(language) || self.can_run_natively(language)
    }

    pub fn plan(&self, language: Language) -> StrategyPlan {
        match (self.can_isolate(language), self.can_run_natively(language)) {
            (true, native_fallback) => StrategyPlan::Isolated { native_fallback },
            (false, true) => StrategyPlan::Native,
            (false, false) => StrategyPlan::Unavailable,
        }
    }

    pub fn executable_languages(&self) -> Vec<Language> {
        self.languages
            .keys()
            .copied()
            .filter(|language| self.is_executable(*language))
            .collect()
    }

    pub fn health(&self) -> HealthReport {
        let supported_languages = self.executable_languages();
        let overall_status = if supported_languages.is_empty() {
            OverallStatus::Unhealthy
        } else {
            OverallStatus::Healthy
        };
        HealthReport {
            isolation_available: self.isolation_available,
            per_language_image_ready: self
                .languages
                .iter()
                .map(|(language, cap)| (*language, self.isolation_available && cap.image_ready))
                .collect(),
            per_language_native_available: self
                .languages
                .iter()
                .map(|(language, cap)| (*language, cap.native_available))
                .collect(),
            supported_languages,
            overall_status,
        }
    }

    /// Human-readable capability table for operators
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Container isolation: {}",
            if self.isolation_available { "available" } else { "unavailable" }
        );
        for (language, cap) in &self.languages {
            let route = match self.plan(*language) {
                StrategyPlan::Isolated { native_fallback: true } => "isolated, native fallback",
                StrategyPlan::Isolated { native_fallback: false } => "isolated only",
                StrategyPlan::Native => "native only (no isolation)",
                StrategyPlan::Unavailable => "unavailable",
            };
            let _ = writeln!(
                out,
                "  {:<11} image: {:<3} native: {:<3} -> {}",
                language.id(),
                if cap.image_ready { "yes" } else { "no" },
                if cap.native_available { "yes" } else { "no" },
                route
            );
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Unhealthy,
}

/// Status object exposed to ops tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub isolation_available: bool,
    pub per_language_image_ready: BTreeMap<Language, bool>,
    pub per_language_native_available: BTreeMap<Language, bool>,
    pub supported_languages: Vec<Language>,
    pub overall_status: OverallStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(isolation: bool, image: bool, native: bool) -> CapabilityMatrix {
        CapabilityMatrix::new(isolation).with_language(Language::Cpp, image, native)
    }

    #[test]
    fn test_plan_for_every_capability_combination() {
        for isolation in [false, true] {
            for image in [false, true] {
                for native in [false, true] {
                    let plan = single(isolation, image, native).plan(Language::Cpp);
                    let expected = if isolation && image {
                        StrategyPlan::Isolated { native_fallback: native }
                    } else if native {
                        StrategyPlan::Native
                    } else {
                        StrategyPlan::Unavailable
                    };
                    assert_eq!(plan, expected, "({}, {}, {})", isolation, image, native);
                }
            }
        }
    }

    #[test]
    fn test_executable_iff_isolated_or_native() {
        assert!(single(true, true, false).is_executable(Language::Cpp));
        assert!(single(false, true, true).is_executable(Language::Cpp));
        assert!(!single(false, true, false).is_executable(Language::Cpp));
        assert!(!single(true, false, false).is_executable(Language::Cpp));
        // languages absent from the matrix are never executable
        assert!(!single(true, true, true).is_executable(Language::Java));
    }

    #[test]
    fn test_health_report() {
        let matrix = CapabilityMatrix::new(false)
            .with_language(Language::Python, true, true)
            .with_language(Language::Java, true, false);
        let health = matrix.health();

        assert_eq!(health.overall_status, OverallStatus::Healthy);
        assert_eq!(health.supported_languages, vec![Language::Python]);
        assert_eq!(health.per_language_image_ready.get(&Language::Python), Some(&false));
        assert_eq!(health.per_language_native_available.get(&Language::Java), Some(&false));

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["overallStatus"], "healthy");
        assert_eq!(json["perLanguageNativeAvailable"]["python"], true);
        assert_eq!(json["supportedLanguages"][0], "python");
    }

    #[test]
    fn test_all_false_matrix_is_unhealthy() {
        let matrix = CapabilityMatrix::new(false).with_language(Language::Cpp, false, false);
        assert_eq!(matrix.health().overall_status, OverallStatus::Unhealthy);
        assert!(matrix.report().contains("unavailable"));
    }
}
