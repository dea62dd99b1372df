//! Equipment catalog.
//!
//! The detector emits one of eight class ids: ids 0..=3 mark equipment worn
//! correctly, ids 4..=7 mark the same equipment missing, in the order
//! glasses, helmet, gloves, ear protection. The catalog maps each id to a
//! human-readable name and is shared read-only for the lifetime of the process.

use anyhow::{anyhow, Result};
use serde::Serialize;

/// Number of classes the detector is trained on.
pub const CLASS_COUNT: usize = 8;

/// Number of equipment kinds (each has a present and an absent class).
pub const EQUIPMENT_KINDS: usize = 4;

/// Class ids that signal missing equipment.
pub const ABSENT_CLASS_IDS: [u32; EQUIPMENT_KINDS] = [4, 5, 6, 7];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Equipment {
    Glasses,
    Helmet,
    Gloves,
    EarProtection,
}

impl Equipment {
    const ORDER: [Equipment; EQUIPMENT_KINDS] = [
        Equipment::Glasses,
        Equipment::Helmet,
        Equipment::Gloves,
        Equipment::EarProtection,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Presence {
    Present,
    Absent,
}

/// Decoded detector class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EquipmentClass {
    pub id: u32,
    pub equipment: Equipment,
    pub presence: Presence,
}

impl EquipmentClass {
    pub fn from_id(id: u32) -> Option<Self> {
        if id as usize >= CLASS_COUNT {
            return None;
        }
        let presence = if (id as usize) < EQUIPMENT_KINDS {
            Presence::Present
        } else {
            Presence::Absent
        };
        Some(Self {
            id,
            equipment: Equipment::ORDER[id as usize % EQUIPMENT_KINDS],
            presence,
        })
    }

    pub fn is_absent(&self) -> bool {
        self.presence == Presence::Absent
    }
}

/// Returns true when `class_id` is one of the missing-equipment classes.
pub fn is_absent_class(class_id: u32) -> bool {
    EquipmentClass::from_id(class_id).is_some_and(|class| class.is_absent())
}

/// Mapping from class id to equipment name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EquipmentCatalog {
    names: Vec<String>,
}

impl EquipmentCatalog {
    /// Build a catalog from the present-class and absent-class name tables.
    ///
    /// Both tables are ordered glasses, helmet, gloves, ear protection.
    pub fn new(present: &[String], absent: &[String]) -> Result<Self> {
        if present.len() != EQUIPMENT_KINDS || absent.len() != EQUIPMENT_KINDS {
            return Err(anyhow!(
                "equipment catalog needs {} present and {} absent names (got {} and {})",
                EQUIPMENT_KINDS,
                EQUIPMENT_KINDS,
                present.len(),
                absent.len()
            ));
        }
        let names: Vec<String> = present
            .iter()
            .chain(absent.iter())
            .map(|name| name.trim().to_string())
            .collect();
        if let Some(empty) = names.iter().position(|name| name.is_empty()) {
            return Err(anyhow!("equipment class {} has an empty name", empty));
        }
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(anyhow!("equipment name '{}' is used twice", name));
            }
        }
        Ok(Self { names })
    }

    pub fn name(&self, class_id: u32) -> Option<&str> {
        self.names.get(class_id as usize).map(String::as_str)
    }

    /// Name for display, falling back to the numeric id for unknown classes.
    pub fn label(&self, class_id: u32) -> String {
        self.name(class_id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("class_{}", class_id))
    }

    /// All `(class_id, name)` pairs in id order.
    pub fn entries(&self) -> impl Iterator<Item = (u32, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(id, name)| (id as u32, name.as_str()))
    }

    /// Names of the missing-equipment classes in id order.
    pub fn absent_names(&self) -> impl Iterator<Item = &str> {
        self.names[EQUIPMENT_KINDS..].iter().map(String::as_str)
    }
}

impl Default for EquipmentCatalog {
    fn default() -> Self {
        let names = [
            "Glasses",
            "Helmet",
            "Gloves",
            "Ear Protection",
            "No Glasses",
            "No Helmet",
            "No Gloves",
            "No Ear Protection",
        ];
        Self {
            names: names.iter().map(|name| name.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn class_ids_split_into_present_and_absent() {
        for id in 0..4 {
            assert!(!is_absent_class(id));
        }
        for id in ABSENT_CLASS_IDS {
            assert!(is_absent_class(id));
        }
        assert!(!is_absent_class(8));

        let class = EquipmentClass::from_id(5).unwrap();
        assert_eq!(class.equipment, Equipment::Helmet);
        assert_eq!(class.presence, Presence::Absent);
    }

    #[test]
    fn catalog_maps_ids_to_names() -> Result<()> {
        let catalog = EquipmentCatalog::new(
            &strings(&["Com_Oculos", "Com_Capacete", "Com_Luva", "Com_Abafador"]),
            &strings(&["Sem_Oculos", "Sem_Capacete", "Sem_Luva", "Sem_Abafador"]),
        )?;
        assert_eq!(catalog.name(1), Some("Com_Capacete"));
        assert_eq!(catalog.name(7), Some("Sem_Abafador"));
        assert_eq!(catalog.name(8), None);
        assert_eq!(catalog.label(9), "class_9");
        assert_eq!(
            catalog.absent_names().collect::<Vec<_>>(),
            vec!["Sem_Oculos", "Sem_Capacete", "Sem_Luva", "Sem_Abafador"]
        );
        Ok(())
    }

    #[test]
    fn catalog_rejects_bad_tables() {
        let four = strings(&["a", "b", "c", "d"]);
        assert!(EquipmentCatalog::new(&four, &strings(&["e", "f", "g"])).is_err());
        assert!(EquipmentCatalog::new(&four, &strings(&["e", "f", "g", " "])).is_err());
        assert!(EquipmentCatalog::new(&four, &strings(&["e", "f", "g", "a"])).is_err());
    }
}
