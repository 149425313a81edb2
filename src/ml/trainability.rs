// ============================================================
// Layer 5 — Module Trainability Selector
// ============================================================
// Turns the coarse `finetune_modules` list into one flag per
// parameter key. A parameter is trainable only when a listed
// module covers its key; everything else stays frozen. The mask
// is total: every key of the model has an entry.

use std::collections::BTreeMap;

use crate::domain::architecture::{Architecture, ModulePart};
use crate::domain::error::{FinetuneError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainabilityMask {
    flags: BTreeMap<String, bool>,
}

impl TrainabilityMask {
    /// Every parameter trainable: a run started from scratch.
    pub fn all_trainable<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { flags: keys.into_iter().map(|k| (k.into(), true)).collect() }
    }

    /// Every parameter frozen: inference only.
    pub fn all_frozen<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { flags: keys.into_iter().map(|k| (k.into(), false)).collect() }
    }

    /// Keys outside the mask are treated as frozen.
    pub fn is_trainable(&self, key: &str) -> bool {
        self.flags.get(key).copied().unwrap_or(false)
    }

    pub fn trainable_keys(&self) -> impl Iterator<Item = &str> {
        self.flags.iter().filter(|(_, t)| **t).map(|(k, _)| k.as_str())
    }

    pub fn frozen_keys(&self) -> impl Iterator<Item = &str> {
        self.flags.iter().filter(|(_, t)| !**t).map(|(k, _)| k.as_str())
    }

    pub fn trainable_count(&self) -> usize {
        self.trainable_keys().count()
    }

    pub fn has_trainable(&self) -> bool {
        self.flags.values().any(|t| *t)
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

/// Reject any module name the architecture does not declare.
pub fn validate_modules(architecture: Architecture, modules: &[String]) -> Result<Vec<&'static ModulePart>> {
    modules
        .iter()
        .map(|name| {
            architecture.module_part(name).ok_or_else(|| FinetuneError::UnknownModule {
                module:       name.clone(),
                architecture: architecture.name().to_string(),
                known:        architecture.module_names(),
            })
        })
        .collect()
}

/// Compute the mask for a finetuning run.
///
/// # Arguments
/// * `architecture`     - Declares the module names and their key prefixes
/// * `parameter_keys`   - Every structural key of the instantiated model
/// * `finetune_modules` - Names to unfreeze; may be empty
pub fn select_trainable<S: AsRef<str>>(
    architecture:     Architecture,
    parameter_keys:   &[S],
    finetune_modules: &[String],
) -> Result<TrainabilityMask> {
    let parts = validate_modules(architecture, finetune_modules)?;

    let flags: BTreeMap<String, bool> = parameter_keys
        .iter()
        .map(|key| {
            let key = key.as_ref();
            (key.to_string(), parts.iter().any(|p| p.covers(key)))
        })
        .collect();

    let mask = TrainabilityMask { flags };
    if !mask.has_trainable() {
        tracing::warn!("No trainable parameters selected; finetuning will not update the model");
    }
    tracing::info!(
        "Trainability: {}/{} parameter tensors trainable ({})",
        mask.trainable_count(),
        mask.len(),
        finetune_modules.join(", "),
    );
    Ok(mask)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: &[&str] = &[
        "embedding_net.bias",
        "embedding_net.weight",
        "head.bias",
        "head.weight",
        "lstm.hidden_transform.weight",
        "lstm.input_transform.bias",
        "lstm.input_transform.weight",
    ];

    #[test]
    fn test_head_only() {
        let mask = select_trainable(Architecture::CudaLstm, KEYS, &["head".to_string()]).unwrap();
        assert_eq!(mask.trainable_keys().collect::<Vec<_>>(), ["head.bias", "head.weight"]);
        assert_eq!(mask.len(), KEYS.len());
        assert!(!mask.is_trainable("lstm.input_transform.weight"));
    }

    #[test]
    fn test_multiple_modules() {
        let modules = vec!["lstm".to_string(), "head".to_string()];
        let mask = select_trainable(Architecture::CudaLstm, KEYS, &modules).unwrap();
        assert_eq!(mask.trainable_count(), 5);
        assert_eq!(mask.frozen_keys().collect::<Vec<_>>(), ["embedding_net.bias", "embedding_net.weight"]);
    }

    #[test]
    fn test_empty_list_freezes_everything() {
        let mask = select_trainable(Architecture::CudaLstm, KEYS, &[]).unwrap();
        assert!(!mask.has_trainable());
        assert_eq!(mask.len(), KEYS.len());
    }

    #[test]
    fn test_unknown_module_is_named() {
        let err = select_trainable(Architecture::EaLstm, KEYS, &["embedding_net".to_string()]).unwrap_err();
        match err {
            FinetuneError::UnknownModule { module, architecture, known } => {
                assert_eq!(module, "embedding_net");
                assert_eq!(architecture, "ealstm");
                assert!(known.contains(&"input_gate".to_string()));
            }
            other => panic!("expected UnknownModule, got {other:?}"),
        }
    }

    #[test]
    fn test_unlisted_key_defaults_to_frozen() {
        let mask = TrainabilityMask::all_trainable(KEYS.iter().copied());
        assert!(mask.is_trainable("head.weight"));
        assert!(!mask.is_trainable("not.a.parameter"));
    }
}
