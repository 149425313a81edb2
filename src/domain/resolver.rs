// ============================================================
// Layer 3 — Configuration Resolver
// ============================================================
// Produces the record a new run is trained with.
//
//   resolve_fresh     — `start`: the user's record, with the
//                       finetuning fields forced off.
//   resolve_finetune  — `finetune`: a copy of the base run's
//                       persisted record with the override
//                       applied on top, except for fields that
//                       decide parameter shapes.

use serde_yaml::Value;

use crate::domain::config::{keys, Config};
use crate::domain::error::{FinetuneError, Result};

/// Fields a finetune override may not change. Each one decides the shape
/// or identity of at least one parameter tensor, so changing it would make
/// the base checkpoint unloadable.
pub const IMMUTABLE_FIELDS: &[&str] = &[
    keys::MODEL,
    keys::HIDDEN_SIZE,
    keys::DYNAMIC_INPUTS,
    keys::STATIC_ATTRIBUTES,
    keys::TARGET_VARIABLES,
];

/// Fields every finetune override must carry.
pub const REQUIRED_OVERRIDE_FIELDS: &[&str] = &[keys::BASE_RUN_DIR, keys::FINETUNE_MODULES];

pub fn is_immutable(key: &str) -> bool {
    IMMUTABLE_FIELDS.contains(&key)
}

/// Record for a run trained from scratch.
pub fn resolve_fresh(config: &Config) -> Config {
    config
        .without(keys::BASE_RUN_DIR)
        .without(keys::FINETUNE_MODULES)
        .with(keys::IS_FINETUNING, false)
}

/// Merge `overrides` onto a copy of `base`.
///
/// # Errors
/// * `MissingRequiredField` if `base_run_dir` or `finetune_modules` is absent
/// * `InvalidField` if `finetune_modules` is not a list of strings
/// * `ConfigConflict` listing every immutable field the override changes
pub fn resolve_finetune(base: &Config, overrides: &Config) -> Result<Config> {
    for field in REQUIRED_OVERRIDE_FIELDS {
        if matches!(overrides.get(field), None | Some(Value::Null)) {
            return Err(FinetuneError::missing(*field));
        }
    }
    let base_run_dir = overrides
        .base_run_dir()
        .ok_or_else(|| FinetuneError::invalid(keys::BASE_RUN_DIR, "expected a path string"))?;
    // Validates the shape of the module list; names are checked against the
    // architecture once the model is built.
    let modules = overrides.finetune_modules()?;

    let conflicts: Vec<String> = IMMUTABLE_FIELDS
        .iter()
        .filter(|key| changes_field(base, overrides, key))
        .map(|key| key.to_string())
        .collect();
    if !conflicts.is_empty() {
        return Err(FinetuneError::ConfigConflict { keys: conflicts });
    }

    let mut resolved = base.clone();
    for (key, value) in overrides.entries() {
        let Some(key) = key.as_str() else {
            return Err(FinetuneError::invalid(format!("{key:?}"), "configuration keys must be strings"));
        };
        if is_immutable(key) {
            continue;
        }
        resolved = resolved.with(key, value.clone());
    }

    let modules: Vec<Value> = modules.into_iter().map(Value::from).collect();
    Ok(resolved
        .with(keys::IS_FINETUNING, true)
        .with(keys::BASE_RUN_DIR, base_run_dir.to_string_lossy().into_owned())
        .with(keys::FINETUNE_MODULES, modules))
}

/// An override "changes" a field when it reads back differently from the
/// base value. Both sides are compared as the typed accessors see them, so
/// `qobs` equals `[qobs]` and an absent `static_attributes` equals `[]`.
/// Values the accessors reject are compared verbatim.
fn changes_field(base: &Config, overrides: &Config, key: &str) -> bool {
    let Some(raw) = overrides.get(key) else {
        return false;
    };
    match (normalized(base, key), normalized(overrides, key)) {
        (Some(b), Some(o)) => b != o,
        _ => match base.get(key) {
            Some(b) => b != raw,
            None    => !raw.is_null(),
        },
    }
}

fn normalized(config: &Config, key: &str) -> Option<Value> {
    let list = |items: Vec<String>| Value::Sequence(items.into_iter().map(Value::from).collect());
    match key {
        keys::MODEL             => config.architecture().ok().map(|a| Value::from(a.name())),
        keys::HIDDEN_SIZE       => config.hidden_size().ok().map(|n| Value::from(n as u64)),
        keys::DYNAMIC_INPUTS    => config.dynamic_inputs().ok().map(list),
        keys::STATIC_ATTRIBUTES => config.static_attributes().ok().map(list),
        keys::TARGET_VARIABLES  => config.target_variables().ok().map(list),
        _                       => config.get(key).cloned(),
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn base() -> Config {
        Config::from_yaml_str(
            r#"
experiment_name: camels
model: cudalstm
hidden_size: 128
dynamic_inputs: [prcp, tmax, srad]
static_attributes: [area, elev_mean]
target_variables: [qobs]
seq_length: 365
epochs: 30
learning_rate: {0: 0.001, 20: 0.0005}
train_basin_file: all_basins.txt
train_start_date: 01/10/1999
train_end_date: 30/09/2008
"#,
        )
        .unwrap()
    }

    fn minimal_override() -> Config {
        Config::default()
            .with(keys::BASE_RUN_DIR, "runs/camels_0101_120000")
            .with(keys::FINETUNE_MODULES, vec![Value::from("head")])
    }

    #[test]
    fn test_hidden_size_change_is_a_conflict() {
        let overrides = minimal_override().with(keys::HIDDEN_SIZE, 64u64);
        let err = resolve_finetune(&base(), &overrides).unwrap_err();
        match err {
            FinetuneError::ConfigConflict { keys } => assert_eq!(keys, ["hidden_size"]),
            other => panic!("expected ConfigConflict, got {other:?}"),
        }
    }

    #[test]
    fn test_all_conflicting_fields_are_reported() {
        let overrides = minimal_override()
            .with(keys::TARGET_VARIABLES, vec![Value::from("qsim")])
            .with(keys::MODEL, "ealstm");
        let err = resolve_finetune(&base(), &overrides).unwrap_err();
        assert!(matches!(
            err,
            FinetuneError::ConfigConflict { ref keys } if keys == &["model", "target_variables"]
        ));
    }

    #[test]
    fn test_equal_immutable_override_is_tolerated() {
        let overrides = minimal_override().with(keys::HIDDEN_SIZE, 128u64);
        let resolved  = resolve_finetune(&base(), &overrides).unwrap();
        assert_eq!(resolved.hidden_size().unwrap(), 128);
    }

    #[test]
    fn test_equivalent_list_spellings_are_tolerated() {
        let base = base()
            .with(keys::TARGET_VARIABLES, "qobs")
            .without(keys::STATIC_ATTRIBUTES);
        let overrides = minimal_override()
            .with(keys::TARGET_VARIABLES, vec![Value::from("qobs")])
            .with(keys::STATIC_ATTRIBUTES, Vec::<Value>::new());
        let resolved = resolve_finetune(&base, &overrides).unwrap();
        assert_eq!(resolved.target_variables().unwrap(), ["qobs"]);
        assert!(resolved.static_attributes().unwrap().is_empty());
    }

    #[test]
    fn test_clearing_present_statics_is_a_conflict() {
        let overrides = minimal_override().with(keys::STATIC_ATTRIBUTES, Vec::<Value>::new());
        let err = resolve_finetune(&base(), &overrides).unwrap_err();
        assert!(matches!(
            err,
            FinetuneError::ConfigConflict { ref keys } if keys == &["static_attributes"]
        ));
    }

    #[test]
    fn test_basin_file_override() {
        let overrides = minimal_override().with("train_basin_file", "one_basin.txt");
        let resolved  = resolve_finetune(&base(), &overrides).unwrap();

        assert_eq!(resolved.get("train_basin_file"), Some(&Value::from("one_basin.txt")));
        assert_eq!(resolved.finetune_modules().unwrap(), ["head"]);
        for key in base().keys().filter(|k| *k != "train_basin_file") {
            assert_eq!(resolved.get(key), base().get(key), "field '{key}' changed");
        }
    }

    #[test]
    fn test_missing_base_run_dir() {
        let overrides = Config::default().with(keys::FINETUNE_MODULES, vec![Value::from("head")]);
        let err = resolve_finetune(&base(), &overrides).unwrap_err();
        assert!(matches!(
            err,
            FinetuneError::MissingRequiredField { ref field } if field == "base_run_dir"
        ));
    }

    #[test]
    fn test_missing_finetune_modules() {
        let overrides = Config::default().with(keys::BASE_RUN_DIR, "runs/x");
        let err = resolve_finetune(&base(), &overrides).unwrap_err();
        assert!(matches!(
            err,
            FinetuneError::MissingRequiredField { ref field } if field == "finetune_modules"
        ));
    }

    #[test]
    fn test_empty_module_list_is_accepted() {
        let overrides = minimal_override().with(keys::FINETUNE_MODULES, Vec::<Value>::new());
        let resolved  = resolve_finetune(&base(), &overrides).unwrap();
        assert!(resolved.finetune_modules().unwrap().is_empty());
    }

    #[test]
    fn test_resolution_records_finetuning_flag_and_back_reference() {
        let resolved = resolve_finetune(&base(), &minimal_override()).unwrap();
        assert!(resolved.is_finetuning());
        assert_eq!(
            resolved.base_run_dir().unwrap(),
            std::path::PathBuf::from("runs/camels_0101_120000")
        );
        // The base record itself is untouched.
        assert!(!base().contains(keys::IS_FINETUNING));
    }

    #[test]
    fn test_fresh_resolution_clears_finetune_fields() {
        let polluted = base()
            .with(keys::IS_FINETUNING, true)
            .with(keys::BASE_RUN_DIR, "runs/old");
        let fresh = resolve_fresh(&polluted);
        assert!(!fresh.is_finetuning());
        assert!(fresh.base_run_dir().is_none());
    }

    fn mutable_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<u32>().prop_map(|n| Value::from(n as u64)),
            "[a-z_]{1,12}\\.txt".prop_map(Value::from),
            (1u32..1000).prop_map(|n| Value::from(n as f64 / 1000.0)),
        ]
    }

    proptest! {
        #[test]
        fn prop_identity_override_only_adds_finetune_fields(dir in "[a-z]{1,10}/[a-z0-9_]{1,16}") {
            let overrides = Config::default()
                .with(keys::BASE_RUN_DIR, dir.as_str())
                .with(keys::FINETUNE_MODULES, vec![Value::from("lstm")]);
            let resolved = resolve_finetune(&base(), &overrides).unwrap();

            let stripped = resolved
                .without(keys::IS_FINETUNING)
                .without(keys::BASE_RUN_DIR)
                .without(keys::FINETUNE_MODULES);
            prop_assert_eq!(stripped, base());
        }

        #[test]
        fn prop_mutable_overrides_are_applied_verbatim(
            key in "(epochs|seq_length|batch_size|train_basin_file|output_dropout|extra_[a-z]{1,6})",
            value in mutable_value(),
        ) {
            let overrides = minimal_override().with(&key, value.clone());
            let resolved  = resolve_finetune(&base(), &overrides).unwrap();
            prop_assert_eq!(resolved.get(&key), Some(&value));
            let base = base();
            for field in IMMUTABLE_FIELDS {
                prop_assert_eq!(resolved.get(field), base.get(field));
            }
        }

        #[test]
        fn prop_changed_immutable_field_always_conflicts(
            idx in 0..IMMUTABLE_FIELDS.len(),
            n in 1u64..10_000,
        ) {
            let key = IMMUTABLE_FIELDS[idx];
            // An integer never equals the base's string or list values, and
            // is offset from the base hidden_size.
            let overrides = minimal_override().with(key, Value::from(128 + n));
            let result = resolve_finetune(&base(), &overrides);
            let is_conflict = matches!(
                &result,
                Err(FinetuneError::ConfigConflict { keys }) if keys == &[key.to_string()]
            );
            prop_assert!(is_conflict);
        }
    }
}
