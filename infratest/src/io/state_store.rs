//! Errored-state recovery artifacts.
//!
//! When cleanup cannot destroy everything a run created, the leftover managed
//! instances are written next to the suite so an operator can reconcile them
//! by hand.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::core::state::{State, read_state, write_state};
use crate::io::config::write_atomic;

/// `<dir>/errored_test.<file-stem>.<run>.json`
pub fn errored_state_path(dir: &Path, file_stem: &str, run: &str) -> PathBuf {
    let stem = file_stem.replace(['/', '\\'], "_");
    dir.join(format!("errored_test.{stem}.{run}.json"))
}

/// Persist only the managed instances of `state`.
pub fn write_errored_state(path: &Path, state: &State) -> Result<()> {
    let mut buf = write_state(&state.managed_only())
        .with_context(|| format!("serialize errored state {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, &buf)?;
    info!(path = %path.display(), "wrote errored state");
    Ok(())
}

pub fn load_state(path: &Path) -> Result<State> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read state {}", path.display()))?;
    read_state(&contents).with_context(|| format!("parse state {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{ResourceInstance, ResourceMode};
    use serde_json::{Map, json};

    fn instance(mode: ResourceMode, name: &str) -> ResourceInstance {
        ResourceInstance {
            mode,
            ty: "sim_bucket".to_string(),
            name: name.to_string(),
            attributes: Map::from_iter([("id".to_string(), json!(name))]),
        }
    }

    /// Verifies the artifact holds exactly the managed instances left behind.
    #[test]
    fn errored_state_keeps_only_managed_instances() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = errored_state_path(temp.path(), "main", "setup");
        assert!(path.ends_with("errored_test.main.setup.json"));

        let mut state = State::new();
        for inst in [
            instance(ResourceMode::Managed, "stuck"),
            instance(ResourceMode::Data, "lookup"),
        ] {
            state.resources.insert(inst.address(), inst);
        }
        state.outputs.insert("x".to_string(), json!(1));

        write_errored_state(&path, &state).expect("write");
        let loaded = load_state(&path).expect("load");
        assert_eq!(
            loaded.resources.keys().collect::<Vec<_>>(),
            vec!["sim_bucket.stuck"]
        );
        assert!(loaded.outputs.is_empty());
    }

    #[test]
    fn nested_stems_are_flattened() {
        let path = errored_state_path(Path::new("out"), "nested/main", "r");
        assert_eq!(path, Path::new("out").join("errored_test.nested_main.r.json"));
    }
}
