//! Launch parameters for one worker process
//!
//! [`LaunchParameters`] is immutable per launch. Reconfiguration replaces it
//! wholesale; [`LaunchParameters::requires_relaunch`] tells the watchdog when
//! the replacement can only take effect in a fresh process.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Sandbox level the worker engine runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SecurityLevel {
    /// Full file and shell access
    Trusted,
    /// Restricted to the artifact directory
    #[default]
    Safe,
    /// No file access outside the runtime
    Ultrasafe,
}

impl SecurityLevel {
    /// Command line flag the engine expects for this level
    #[must_use]
    pub const fn as_flag(self) -> &'static str {
        match self {
            Self::Trusted => "-trusted",
            Self::Safe => "-safe",
            Self::Ultrasafe => "-ultrasafe",
        }
    }
}

bitflags! {
    /// How the worker advertises itself
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VisibilityFlags: u8 {
        /// Listed on the public hub
        const PUBLIC = 0b01;
        /// Hidden from the hub even when public
        const INVISIBLE = 0b10;
    }
}

impl VisibilityFlags {
    /// Command line flag the engine expects for these flags
    #[must_use]
    pub fn as_flag(self) -> &'static str {
        if self.contains(Self::INVISIBLE) {
            "-invisible"
        } else if self.contains(Self::PUBLIC) {
            "-public"
        } else {
            "-private"
        }
    }
}

impl Default for VisibilityFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// Serialized as booleans so the on-disk config stays readable
impl Serialize for VisibilityFlags {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("VisibilityFlags", 2)?;
        state.serialize_field("public", &self.contains(Self::PUBLIC))?;
        state.serialize_field("invisible", &self.contains(Self::INVISIBLE))?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for VisibilityFlags {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Helper {
            #[serde(default)]
            public: bool,
            #[serde(default)]
            invisible: bool,
        }

        let h = Helper::deserialize(deserializer)?;
        let mut flags = Self::empty();
        if h.public {
            flags |= Self::PUBLIC;
        }
        if h.invisible {
            flags |= Self::INVISIBLE;
        }
        Ok(flags)
    }
}

/// Immutable configuration for one launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchParameters {
    /// Port the worker listens on
    pub port: u16,
    /// Sandbox level
    pub security_level: SecurityLevel,
    /// Whether browser clients may connect
    pub allow_webclient: bool,
    /// Hub visibility
    pub visibility: VisibilityFlags,
}

impl Default for LaunchParameters {
    fn default() -> Self {
        Self {
            port: 1337,
            security_level: SecurityLevel::default(),
            allow_webclient: false,
            visibility: VisibilityFlags::default(),
        }
    }
}

impl LaunchParameters {
    /// Copy of these parameters listening on another port
    #[must_use]
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    /// Whether switching from `self` to `next` needs a new OS process.
    ///
    /// Port changes are applied to a live worker; everything that ends up on
    /// the engine command line is not.
    #[must_use]
    pub fn requires_relaunch(&self, next: &Self) -> bool {
        self.security_level != next.security_level
            || self.allow_webclient != next.allow_webclient
            || self.visibility != next.visibility
    }
}
