//! Versioned description of the computation that produced a geometry payload.

use serde::{Deserialize, Serialize};

/// Bumped whenever key derivation or payload shape changes.
pub const CURRENT_SCHEMA_VERSION: u32 = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HouseSystem {
    #[default]
    Placidus,
    WholeSign,
    Koch,
    Equal,
}

impl HouseSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            HouseSystem::Placidus => "placidus",
            HouseSystem::WholeSign => "whole_sign",
            HouseSystem::Koch => "koch",
            HouseSystem::Equal => "equal",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZodiacMode {
    #[default]
    Tropical,
    Sidereal,
}

impl ZodiacMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZodiacMode::Tropical => "tropical",
            ZodiacMode::Sidereal => "sidereal",
        }
    }
}

/// Changing any field is a breaking change and yields different book keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineConfig {
    pub house_system: HouseSystem,
    pub zodiac: ZodiacMode,
    pub schema_version: u32,
    pub algorithm_version: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            house_system: HouseSystem::default(),
            zodiac: ZodiacMode::default(),
            schema_version: CURRENT_SCHEMA_VERSION,
            algorithm_version: 1,
        }
    }
}

impl EngineConfig {
    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    /// Field values in hashing order, appended after the input fields.
    pub fn key_fields(&self) -> [String; 4] {
        [
            self.house_system.as_str().to_string(),
            self.zodiac.as_str().to_string(),
            format!("s{}", self.schema_version),
            format!("a{}", self.algorithm_version),
        ]
    }
}
