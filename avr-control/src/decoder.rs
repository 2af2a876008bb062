//! Inbound line classification
//!
//! Lines that do not resolve the in-flight command are tested against the
//! command table in registration order. The first spec whose pattern matches
//! claims the line.

use crate::state::{PropertyState, StateEvent};
use crate::table::CommandTable;

/// Classify one inbound line against the table.
pub fn classify(table: &CommandTable, line: &str) -> StateEvent {
    table
        .iter()
        .find_map(|spec| {
            spec.decode(line).map(|value| StateEvent::Property {
                name: spec.name().to_string(),
                value,
            })
        })
        .unwrap_or_else(|| StateEvent::Unknown {
            line: line.to_string(),
        })
}

/// Apply a classified event to the snapshot. Unknown lines leave it untouched.
pub fn apply(state: &mut PropertyState, event: &StateEvent) -> bool {
    match event {
        StateEvent::Property { name, value } => state.set(name, value.clone()),
        StateEvent::Unknown { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandSpec;
    use crate::state::PropertyValue;
    use crate::table::{INPUT, MUTED, POWER, VOLUME};
    use rstest::rstest;

    #[rstest]
    #[case("MV35", VOLUME, PropertyValue::from("35"))]
    #[case("MUON", MUTED, PropertyValue::Bool(true))]
    #[case("ZMOFF", POWER, PropertyValue::Bool(false))]
    #[case("SISAT/CBL", INPUT, PropertyValue::from("SAT/CBL"))]
    #[case("PSDYNVOL MED", "dynamicVolume", PropertyValue::from("MED"))]
    fn test_classify_default_properties(
        #[case] line: &str,
        #[case] name: &str,
        #[case] value: PropertyValue,
    ) {
        let table = CommandTable::with_defaults().unwrap();
        assert_eq!(
            classify(&table, line),
            StateEvent::Property {
                name: name.to_string(),
                value,
            }
        );
    }

    #[test]
    fn test_unmatched_line_is_unknown_and_not_stored() {
        let table = CommandTable::with_defaults().unwrap();
        let mut state = PropertyState::new();

        let event = classify(&table, "MSDOLBY DIGITAL");
        assert_eq!(
            event,
            StateEvent::Unknown {
                line: "MSDOLBY DIGITAL".to_string()
            }
        );
        assert!(!apply(&mut state, &event));
        assert!(state.is_empty());
    }

    #[test]
    fn test_first_registered_match_wins() {
        let mut table = CommandTable::new();
        table
            .register(CommandSpec::new("first", "AA", "^AA(.*)").unwrap())
            .unwrap();
        table
            .register(CommandSpec::new("second", "BB", "X$").unwrap())
            .unwrap();

        assert_eq!(
            classify(&table, "AAX"),
            StateEvent::Property {
                name: "first".to_string(),
                value: PropertyValue::from("X"),
            }
        );
        assert_eq!(
            classify(&table, "BBX"),
            StateEvent::Property {
                name: "second".to_string(),
                value: PropertyValue::from("X"),
            }
        );
    }

    #[test]
    fn test_apply_updates_snapshot() {
        let table = CommandTable::with_defaults().unwrap();
        let mut state = PropertyState::new();
        assert!(apply(&mut state, &classify(&table, "MV35")));
        assert!(!apply(&mut state, &classify(&table, "MV35")));
        assert_eq!(state.get(VOLUME), Some(&PropertyValue::from("35")));
    }
}
