//! The configuration settings registry and config operations.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::dbstate::ConfigMap;
use crate::error::{CompilerError, Result};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigScope {
    #[strum(serialize = "SESSION")]
    Session,
    #[strum(serialize = "DATABASE")]
    Database,
    #[strum(serialize = "SYSTEM")]
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingType {
    Str,
    Int64,
    Bool,
    Duration,
    Memory,
}

/// Static metadata of one configuration setting.
#[derive(Debug, Clone)]
pub struct SettingSpec {
    /// May only be set with CONFIGURE SYSTEM.
    pub system: bool,
    /// Multi-valued: Add/Rem operations instead of Set.
    pub set_of: bool,
    pub s_type: SettingType,
    /// The backend GUC this setting maps onto, if it is a backend setting.
    pub backend_setting: Option<&'static str>,
    pub requires_restart: bool,
}

pub struct SettingsRegistry(IndexMap<&'static str, SettingSpec>);

impl SettingsRegistry {
    pub fn get(&self, name: &str) -> Option<&SettingSpec> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }
}

static SETTINGS: Lazy<SettingsRegistry> = Lazy::new(|| {
    let mut map = IndexMap::new();
    map.insert(
        "listen_addresses",
        SettingSpec {
            system: true,
            set_of: true,
            s_type: SettingType::Str,
            backend_setting: None,
            requires_restart: true,
        },
    );
    map.insert(
        "listen_port",
        SettingSpec {
            system: true,
            set_of: false,
            s_type: SettingType::Int64,
            backend_setting: None,
            requires_restart: true,
        },
    );
    map.insert(
        "query_work_mem",
        SettingSpec {
            system: false,
            set_of: false,
            s_type: SettingType::Memory,
            backend_setting: Some("work_mem"),
            requires_restart: false,
        },
    );
    map.insert(
        "session_idle_timeout",
        SettingSpec {
            system: false,
            set_of: false,
            s_type: SettingType::Duration,
            backend_setting: Some("idle_in_transaction_session_timeout"),
            requires_restart: false,
        },
    );
    map.insert(
        "allow_user_specified_id",
        SettingSpec {
            system: false,
            set_of: false,
            s_type: SettingType::Bool,
            backend_setting: None,
            requires_restart: false,
        },
    );
    map.insert(
        "apply_access_policies",
        SettingSpec {
            system: false,
            set_of: false,
            s_type: SettingType::Bool,
            backend_setting: None,
            requires_restart: false,
        },
    );
    map.insert(
        "__internal_testmode",
        SettingSpec {
            system: false,
            set_of: false,
            s_type: SettingType::Bool,
            backend_setting: None,
            requires_restart: false,
        },
    );
    map.insert(
        "__internal_no_const_folding",
        SettingSpec {
            system: false,
            set_of: false,
            s_type: SettingType::Bool,
            backend_setting: None,
            requires_restart: false,
        },
    );
    SettingsRegistry(map)
});

pub fn get_settings() -> &'static SettingsRegistry {
    &SETTINGS
}

/// Look up a boolean internal flag in a config map, tolerating settings
/// the registry does not know about.
pub fn lookup_bool(name: &str, config: &ConfigMap) -> bool {
    config
        .get(name)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
    Set,
    Reset,
    Add,
    Rem,
}

/// One evaluated configuration operation, shipped to the host inside a
/// unit and (for SESSION scope) applied to the frame's session config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub opcode: OpCode,
    pub scope: ConfigScope,
    pub name: String,
    pub value: serde_json::Value,
}

impl Operation {
    pub fn apply(&self, registry: &SettingsRegistry, config: ConfigMap) -> Result<ConfigMap> {
        let spec = registry.get(&self.name);
        let mut next = config;
        match self.opcode {
            OpCode::Set => {
                next.insert(self.name.clone(), self.value.clone());
            }
            OpCode::Reset => {
                next.remove(&self.name);
            }
            OpCode::Add | OpCode::Rem => {
                if !spec.map(|s| s.set_of).unwrap_or(false) {
                    return Err(CompilerError::internal(format!(
                        "{:?} operation on non-set setting {:?}",
                        self.opcode, self.name
                    )));
                }
                let mut values: Vec<serde_json::Value> = next
                    .get(&self.name)
                    .and_then(|v| v.as_array().cloned())
                    .unwrap_or_default();
                if self.opcode == OpCode::Add {
                    if !values.contains(&self.value) {
                        values.push(self.value.clone());
                    }
                } else {
                    values.retain(|v| v != &self.value);
                }
                next.insert(self.name.clone(), serde_json::Value::Array(values));
            }
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_reset_roundtrips() {
        let registry = get_settings();
        let op = Operation {
            opcode: OpCode::Set,
            scope: ConfigScope::Session,
            name: "apply_access_policies".into(),
            value: json!(false),
        };
        let cfg = op.apply(registry, ConfigMap::new()).unwrap();
        assert_eq!(cfg.get("apply_access_policies"), Some(&json!(false)));

        let reset = Operation {
            opcode: OpCode::Reset,
            scope: ConfigScope::Session,
            name: "apply_access_policies".into(),
            value: serde_json::Value::Null,
        };
        let cfg = reset.apply(registry, cfg).unwrap();
        assert!(cfg.get("apply_access_policies").is_none());
    }

    #[test]
    fn add_and_rem_manage_set_of_settings() {
        let registry = get_settings();
        let add = |v: &str| Operation {
            opcode: OpCode::Add,
            scope: ConfigScope::System,
            name: "listen_addresses".into(),
            value: json!(v),
        };
        let cfg = add("10.0.0.1").apply(registry, ConfigMap::new()).unwrap();
        let cfg = add("10.0.0.2").apply(registry, cfg).unwrap();
        // Duplicate adds are idempotent.
        let cfg = add("10.0.0.2").apply(registry, cfg).unwrap();
        assert_eq!(
            cfg.get("listen_addresses"),
            Some(&json!(["10.0.0.1", "10.0.0.2"]))
        );

        let rem = Operation {
            opcode: OpCode::Rem,
            scope: ConfigScope::System,
            name: "listen_addresses".into(),
            value: json!("10.0.0.1"),
        };
        let cfg = rem.apply(registry, cfg).unwrap();
        assert_eq!(cfg.get("listen_addresses"), Some(&json!(["10.0.0.2"])));
    }

    #[test]
    fn add_on_scalar_setting_is_internal_error() {
        let op = Operation {
            opcode: OpCode::Add,
            scope: ConfigScope::Session,
            name: "listen_port".into(),
            value: json!(5656),
        };
        assert!(matches!(
            op.apply(get_settings(), ConfigMap::new()),
            Err(CompilerError::InternalServer(_))
        ));
    }
}
