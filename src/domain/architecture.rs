// ============================================================
// Layer 3 — Architecture Declarations
// ============================================================
// Each supported architecture declares, up front, the named
// sub-components a user may unfreeze and the parameter-key
// prefixes each name covers. The trainability selector works
// only from these declarations.

use std::{fmt, str::FromStr};

use crate::domain::error::{FinetuneError, Result};

/// A user-facing module name and the structural key prefixes it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModulePart {
    pub name:     &'static str,
    pub prefixes: &'static [&'static str],
}

impl ModulePart {
    /// True when `key` is `prefix` itself or lives under `prefix.`
    pub fn covers(&self, key: &str) -> bool {
        self.prefixes.iter().any(|p| {
            key == *p || (key.starts_with(p) && key[p.len()..].starts_with('.'))
        })
    }
}

const CUDALSTM_PARTS: &[ModulePart] = &[
    ModulePart { name: "embedding_net", prefixes: &["embedding_net"] },
    ModulePart { name: "lstm",          prefixes: &["lstm"] },
    ModulePart { name: "head",          prefixes: &["head"] },
];

const EALSTM_PARTS: &[ModulePart] = &[
    ModulePart { name: "input_gate",    prefixes: &["input_gate"] },
    ModulePart { name: "dynamic_gates", prefixes: &["dynamic_gates"] },
    ModulePart { name: "head",          prefixes: &["head"] },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// Single LSTM, statics concatenated to every timestep.
    CudaLstm,
    /// Entity-aware LSTM, input gate driven by static attributes only.
    EaLstm,
}

impl Architecture {
    pub fn name(&self) -> &'static str {
        match self {
            Architecture::CudaLstm => "cudalstm",
            Architecture::EaLstm   => "ealstm",
        }
    }

    pub fn module_parts(&self) -> &'static [ModulePart] {
        match self {
            Architecture::CudaLstm => CUDALSTM_PARTS,
            Architecture::EaLstm   => EALSTM_PARTS,
        }
    }

    pub fn module_names(&self) -> Vec<String> {
        self.module_parts().iter().map(|p| p.name.to_string()).collect()
    }

    pub fn module_part(&self, name: &str) -> Option<&'static ModulePart> {
        self.module_parts().iter().find(|p| p.name == name)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = FinetuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cudalstm" | "lstm" => Ok(Architecture::CudaLstm),
            "ealstm"            => Ok(Architecture::EaLstm),
            other => Err(FinetuneError::UnknownArchitecture(other.to_string())),
        }
    }
}
