use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PermissionRef {
    pub group: String,
    pub permission: String,
}

impl PermissionRef {
    #[must_use]
    pub fn new(group: &str, permission: &str) -> Self {
        Self { group: group.to_string(), permission: permission.to_string() }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionValue {
    Allow,
    Deny,
    Unset,
}

impl PermissionValue {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Unset => "unset",
        }
    }
}

/// True when bit `power` is set in `bits`.
#[must_use]
pub fn bit_set(bits: i64, power: u32) -> bool {
    power < 63 && bits & (1_i64 << power) != 0
}

/// Maps bit positions of a legacy permission integer to target permissions.
///
/// Loaded from configuration so each legacy version can ship its own layout.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PermissionBitMap {
    bits: BTreeMap<u32, Vec<PermissionRef>>,
}

impl PermissionBitMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, power: u32, group: &str, permission: &str) -> Self {
        self.bits.entry(power).or_default().push(PermissionRef::new(group, permission));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Expands a legacy permission integer: mapped bits that are set allow, cleared bits are
    /// left unset.
    #[must_use]
    pub fn apply(&self, bits: i64) -> PermissionSet {
        let mut set = PermissionSet::default();
        for (power, targets) in &self.bits {
            let value =
                if bit_set(bits, *power) { PermissionValue::Allow } else { PermissionValue::Unset };
            for target in targets {
                set.set(target.clone(), value);
            }
        }
        set
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PermissionSet {
    entries: BTreeMap<PermissionRef, PermissionValue>,
}

impl PermissionSet {
    /// Records a value. An existing allow is never downgraded by a later unset.
    pub fn set(&mut self, target: PermissionRef, value: PermissionValue) {
        let entry = self.entries.entry(target).or_insert(value);
        if *entry == PermissionValue::Unset || value == PermissionValue::Deny {
            *entry = value;
        }
    }

    #[must_use]
    pub fn get(&self, group: &str, permission: &str) -> Option<PermissionValue> {
        self.entries.get(&PermissionRef::new(group, permission)).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PermissionRef, PermissionValue)> {
        self.entries.iter().map(|(target, value)| (target, *value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
