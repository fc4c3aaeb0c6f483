use core::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state. Numeric codes match the status documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Disabled = 0,
    Enabled = 1,
    Error = 2,
    Running = 4,
}

impl ModuleState {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Disabled),
            1 => Some(Self::Enabled),
            2 => Some(Self::Error),
            4 => Some(Self::Running),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
            Self::Error => "error",
            Self::Running => "running",
        }
    }

    /// Initialized and not failed.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Enabled | Self::Running)
    }

    pub const fn can_transition_to(self, to: Self) -> bool {
        use ModuleState::*;
        matches!(
            (self, to),
            (Disabled | Enabled | Running, Error)
                | (Disabled | Error, Enabled)
                | (Enabled, Running)
                | (Running, Enabled)
        )
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State requested in the configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigState {
    #[default]
    Enabled,
    Disabled,
    Error,
}

impl ConfigState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enabled" => Some(Self::Enabled),
            "disabled" => Some(Self::Disabled),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ModuleState; 4] = [
        ModuleState::Disabled,
        ModuleState::Enabled,
        ModuleState::Error,
        ModuleState::Running,
    ];

    #[test]
    fn codes_round_trip() {
        for s in ALL {
            assert_eq!(ModuleState::from_code(s.code()), Some(s));
        }
        assert_eq!(ModuleState::from_code(3), None);
    }

    #[test]
    fn transition_table() {
        use ModuleState::*;
        for s in ALL {
            assert!(!s.can_transition_to(s), "{s} loops onto itself");
        }
        assert!(Disabled.can_transition_to(Error));
        assert!(Enabled.can_transition_to(Error));
        assert!(Running.can_transition_to(Error));
        assert!(Disabled.can_transition_to(Enabled));
        assert!(Error.can_transition_to(Enabled));
        assert!(Enabled.can_transition_to(Running));
        assert!(Running.can_transition_to(Enabled));
        assert!(!Disabled.can_transition_to(Running));
        assert!(!Error.can_transition_to(Running));
        assert!(!Running.can_transition_to(Disabled));
        assert!(!Enabled.can_transition_to(Disabled));
    }

    #[test]
    fn active_states() {
        assert!(ModuleState::Enabled.is_active());
        assert!(ModuleState::Running.is_active());
        assert!(!ModuleState::Error.is_active());
        assert!(!ModuleState::Disabled.is_active());
    }

    #[test]
    fn config_state_parse() {
        assert_eq!(ConfigState::parse("disabled"), Some(ConfigState::Disabled));
        assert_eq!(ConfigState::parse("off"), None);
        assert_eq!(ConfigState::default().as_str(), "enabled");
    }
}
