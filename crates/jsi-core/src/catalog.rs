//! Solver catalogue: definitions, PATH resolution and the scan cache
//!
//! Definitions come from `$HOME/.jsi/solvers.json` when present,
//! otherwise from the bundled defaults. Resolving a definition to an
//! executable walks `$PATH` once and memoises the result in
//! `$HOME/.jsi/cache.json`; the cache is written atomically and is
//! always safe to delete.

use crate::error::JsiError;
use crate::verdict::Verdict;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Token replaced with the input path in `args`
const FILE_TOKEN: &str = "{file}";

const DEFAULT_DEFINITIONS: &str = include_str!("defaults.json");

/// Benchmarking stand-in for a real solver: exits 0 after writing the
/// literal verdict, without spawning any process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VirtualMode {
    AlwaysSat,
    AlwaysUnsat,
}

impl VirtualMode {
    pub fn verdict(&self) -> Verdict {
        match self {
            VirtualMode::AlwaysSat => Verdict::Sat,
            VirtualMode::AlwaysUnsat => Verdict::Unsat,
        }
    }
}

/// One entry of the solver catalogue
///
/// Unknown fields are ignored so older binaries keep reading newer
/// catalogue files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverDefinition {
    pub name: String,
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Extra argv appended when the caller asks for a model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_arg: Option<Vec<String>>,
    /// Remaps solver-specific exit codes to verdicts, overriding the
    /// stdout-prefix classification for matching codes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict_map: Option<BTreeMap<String, Verdict>>,
    #[serde(
        default,
        rename = "virtual",
        skip_serializing_if = "Option::is_none"
    )]
    pub virtual_mode: Option<VirtualMode>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    solvers: Vec<SolverDefinition>,
}

/// A fully resolved, ready-to-spawn solver invocation
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdout_path: PathBuf,
    pub verdict_map: Option<BTreeMap<String, Verdict>>,
    pub virtual_mode: Option<VirtualMode>,
}

/// The loaded solver catalogue
#[derive(Debug, Clone)]
pub struct Catalog {
    definitions: Vec<SolverDefinition>,
    cache_path: PathBuf,
}

impl Catalog {
    /// Load definitions from `{home}/solvers.json`, falling back to the
    /// bundled defaults
    pub fn load(home: &Path) -> Result<Self, JsiError> {
        let user_path = home.join("solvers.json");
        let definitions = if user_path.exists() {
            debug!(path = %user_path.display(), "loading solver definitions");
            let data = fs::read_to_string(&user_path)?;
            parse_definitions(&data)?
        } else {
            debug!("no user definitions, using bundled defaults");
            parse_definitions(DEFAULT_DEFINITIONS)?
        };

        Ok(Self {
            definitions,
            cache_path: home.join("cache.json"),
        })
    }

    /// Build a catalogue directly from definitions (tests, embedding)
    pub fn from_definitions(definitions: Vec<SolverDefinition>, cache_path: PathBuf) -> Self {
        Self {
            definitions,
            cache_path,
        }
    }

    pub fn definitions(&self) -> &[SolverDefinition] {
        &self.definitions
    }

    /// Resolve the catalogue to ready-to-spawn command specs.
    ///
    /// `sequence` filters and orders the solvers; without it, all
    /// enabled definitions run in declaration order. Each stdout file
    /// is `{output_dir}/{input_basename}.{solver}.out`.
    pub fn resolve(
        &self,
        sequence: Option<&[String]>,
        input: &Path,
        output_dir: &Path,
        model: bool,
    ) -> Result<Vec<CommandSpec>, JsiError> {
        let selected: Vec<&SolverDefinition> = match sequence {
            Some(names) => {
                let mut picked = Vec::with_capacity(names.len());
                for name in names {
                    let def = self
                        .definitions
                        .iter()
                        .find(|d| &d.name == name)
                        .ok_or_else(|| JsiError::UnknownSolver(name.clone()))?;
                    picked.push(def);
                }
                picked
            }
            None => self.definitions.iter().filter(|d| d.enabled).collect(),
        };

        let mut cache = PathCache::load(&self.cache_path);
        let mut specs = Vec::with_capacity(selected.len());
        let basename = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());

        for def in selected {
            let program = if def.virtual_mode.is_some() {
                // virtual solvers never spawn, any placeholder will do
                PathBuf::from(&def.executable)
            } else {
                match cache.lookup(&def.name, &def.executable) {
                    Some(path) => path,
                    None => {
                        warn!(solver = %def.name, "not found on PATH");
                        continue;
                    }
                }
            };

            let mut args: Vec<String> = def
                .args
                .iter()
                .map(|arg| arg.replace(FILE_TOKEN, &input.to_string_lossy()))
                .collect();
            if !def.args.iter().any(|arg| arg.contains(FILE_TOKEN)) {
                args.push(input.to_string_lossy().into_owned());
            }
            if model {
                if let Some(model_arg) = &def.model_arg {
                    args.extend(model_arg.iter().cloned());
                }
            }

            specs.push(CommandSpec {
                name: def.name.clone(),
                program,
                args,
                stdout_path: output_dir.join(format!("{basename}.{}.out", def.name)),
                verdict_map: def.verdict_map.clone(),
                virtual_mode: def.virtual_mode,
            });
        }

        cache.store(&self.cache_path);

        if specs.is_empty() {
            return Err(JsiError::NoSolversAvailable);
        }
        Ok(specs)
    }
}

fn parse_definitions(data: &str) -> Result<Vec<SolverDefinition>, JsiError> {
    let file: CatalogFile =
        serde_json::from_str(data).map_err(|err| JsiError::Config(err.to_string()))?;
    Ok(file.solvers)
}

/// Memoised results of walking `$PATH` for solver executables
struct PathCache {
    entries: BTreeMap<String, PathBuf>,
    dirty: bool,
}

impl PathCache {
    fn load(path: &Path) -> Self {
        let entries = fs::read_to_string(path)
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_default();
        Self {
            entries,
            dirty: false,
        }
    }

    fn lookup(&mut self, name: &str, executable: &str) -> Option<PathBuf> {
        if let Some(path) = self.entries.get(name) {
            return Some(path.clone());
        }
        let found = which::which(executable).ok()?;
        debug!(solver = name, path = %found.display(), "resolved on PATH");
        self.entries.insert(name.to_string(), found.clone());
        self.dirty = true;
        Some(found)
    }

    /// Write the cache atomically (tmp file in the same directory, then
    /// rename) so that concurrent readers never observe a torn file.
    fn store(&self, path: &Path) {
        if !self.dirty {
            return;
        }
        if let Err(err) = self.store_inner(path) {
            warn!(%err, "failed to write solver path cache");
        }
    }

    fn store_inner(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(&self.entries)?;
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn echo_definition(name: &str) -> SolverDefinition {
        SolverDefinition {
            name: name.to_string(),
            executable: "sh".to_string(),
            args: vec!["-c".to_string(), "echo sat".to_string()],
            enabled: true,
            model_arg: None,
            verdict_map: None,
            virtual_mode: None,
        }
    }

    fn catalog_with(defs: Vec<SolverDefinition>, home: &Path) -> Catalog {
        Catalog::from_definitions(defs, home.join("cache.json"))
    }

    #[test]
    fn bundled_defaults_parse() {
        let defs = parse_definitions(DEFAULT_DEFINITIONS).unwrap();
        assert!(defs.iter().any(|d| d.name == "z3"));
        assert!(defs.iter().all(|d| d.enabled));
    }

    #[test]
    fn bad_definitions_are_a_config_error() {
        let err = parse_definitions("{\"solvers\": 42}").unwrap_err();
        assert!(matches!(err, JsiError::Config(_)));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let defs = parse_definitions(
            r#"{"solvers": [{"name": "a", "executable": "sh", "args": [], "enabled": true, "future_field": 1}]}"#,
        )
        .unwrap();
        assert_eq!(defs.len(), 1);
    }

    #[test]
    fn sequence_preserves_order() {
        let home = TempDir::new().unwrap();
        let catalog = catalog_with(
            vec![echo_definition("a"), echo_definition("b"), echo_definition("c")],
            home.path(),
        );
        let sequence = vec!["c".to_string(), "a".to_string()];
        let specs = catalog
            .resolve(Some(&sequence), Path::new("/tmp/x.smt2"), home.path(), false)
            .unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a"]);
    }

    #[test]
    fn sequence_with_unknown_name_errors() {
        let home = TempDir::new().unwrap();
        let catalog = catalog_with(vec![echo_definition("a")], home.path());
        let sequence = vec!["nope".to_string()];
        let err = catalog
            .resolve(Some(&sequence), Path::new("/tmp/x.smt2"), home.path(), false)
            .unwrap_err();
        assert!(matches!(err, JsiError::UnknownSolver(name) if name == "nope"));
    }

    #[test]
    fn disabled_solvers_are_skipped() {
        let home = TempDir::new().unwrap();
        let mut disabled = echo_definition("off");
        disabled.enabled = false;
        let catalog = catalog_with(vec![disabled, echo_definition("on")], home.path());
        let specs = catalog
            .resolve(None, Path::new("/tmp/x.smt2"), home.path(), false)
            .unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "on");
    }

    #[test]
    fn nothing_resolvable_is_an_error() {
        let home = TempDir::new().unwrap();
        let mut def = echo_definition("ghost");
        def.executable = "definitely-not-a-real-solver-binary".to_string();
        let catalog = catalog_with(vec![def], home.path());
        let err = catalog
            .resolve(None, Path::new("/tmp/x.smt2"), home.path(), false)
            .unwrap_err();
        assert!(matches!(err, JsiError::NoSolversAvailable));
    }

    #[test]
    fn file_token_is_substituted() {
        let home = TempDir::new().unwrap();
        let mut def = echo_definition("sub");
        def.args = vec!["--input={file}".to_string()];
        let catalog = catalog_with(vec![def], home.path());
        let specs = catalog
            .resolve(None, Path::new("/tmp/q.smt2"), home.path(), false)
            .unwrap();
        assert_eq!(specs[0].args, vec!["--input=/tmp/q.smt2"]);
    }

    #[test]
    fn input_appended_without_file_token() {
        let home = TempDir::new().unwrap();
        let mut def = echo_definition("app");
        def.args = vec!["--fast".to_string()];
        let catalog = catalog_with(vec![def], home.path());
        let specs = catalog
            .resolve(None, Path::new("/tmp/q.smt2"), home.path(), false)
            .unwrap();
        assert_eq!(specs[0].args, vec!["--fast", "/tmp/q.smt2"]);
    }

    #[test]
    fn model_arg_appended_on_request() {
        let home = TempDir::new().unwrap();
        let mut def = echo_definition("m");
        def.args = vec!["{file}".to_string()];
        def.model_arg = Some(vec!["--produce-models".to_string()]);
        let catalog = catalog_with(vec![def], home.path());

        let specs = catalog
            .resolve(None, Path::new("/tmp/q.smt2"), home.path(), true)
            .unwrap();
        assert_eq!(specs[0].args, vec!["/tmp/q.smt2", "--produce-models"]);

        let specs = catalog
            .resolve(None, Path::new("/tmp/q.smt2"), home.path(), false)
            .unwrap();
        assert_eq!(specs[0].args, vec!["/tmp/q.smt2"]);
    }

    #[test]
    fn stdout_path_convention() {
        let home = TempDir::new().unwrap();
        let catalog = catalog_with(vec![echo_definition("z3")], home.path());
        let specs = catalog
            .resolve(None, Path::new("/work/query.smt2"), Path::new("/out"), false)
            .unwrap();
        assert_eq!(
            specs[0].stdout_path,
            PathBuf::from("/out/query.smt2.z3.out")
        );
    }

    #[test]
    fn cache_is_written_and_reused() {
        let home = TempDir::new().unwrap();
        let cache_path = home.path().join("cache.json");
        let catalog = catalog_with(vec![echo_definition("cached")], home.path());

        catalog
            .resolve(None, Path::new("/tmp/x.smt2"), home.path(), false)
            .unwrap();
        assert!(cache_path.exists());

        let entries: BTreeMap<String, PathBuf> =
            serde_json::from_str(&fs::read_to_string(&cache_path).unwrap()).unwrap();
        assert!(entries.contains_key("cached"));

        // a poisoned executable name must now be served from the cache
        let mut def = echo_definition("cached");
        def.executable = "no-longer-consulted".to_string();
        let catalog = catalog_with(vec![def], home.path());
        let specs = catalog
            .resolve(None, Path::new("/tmp/x.smt2"), home.path(), false)
            .unwrap();
        assert_eq!(specs[0].name, "cached");
    }

    #[test]
    fn corrupt_cache_is_tolerated() {
        let home = TempDir::new().unwrap();
        let cache_path = home.path().join("cache.json");
        fs::write(&cache_path, "{not json").unwrap();

        let catalog = catalog_with(vec![echo_definition("x")], home.path());
        let specs = catalog
            .resolve(None, Path::new("/tmp/x.smt2"), home.path(), false)
            .unwrap();
        assert_eq!(specs.len(), 1);

        // and the rescan repaired the file
        let data = fs::read_to_string(&cache_path).unwrap();
        assert!(serde_json::from_str::<BTreeMap<String, PathBuf>>(&data).is_ok());
    }

    #[test]
    fn cache_writes_leave_no_tmp_behind() {
        let home = TempDir::new().unwrap();
        let catalog = catalog_with(vec![echo_definition("a")], home.path());
        catalog
            .resolve(None, Path::new("/tmp/x.smt2"), home.path(), false)
            .unwrap();

        let leftovers: Vec<_> = fs::read_dir(home.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn virtual_solvers_skip_path_resolution() {
        let home = TempDir::new().unwrap();
        let mut def = echo_definition("always-sat");
        def.executable = "always-sat".to_string();
        def.args = vec![];
        def.virtual_mode = Some(VirtualMode::AlwaysSat);
        let catalog = catalog_with(vec![def], home.path());
        let specs = catalog
            .resolve(None, Path::new("/tmp/x.smt2"), home.path(), false)
            .unwrap();
        assert_eq!(specs[0].virtual_mode, Some(VirtualMode::AlwaysSat));
    }

    #[test]
    fn user_definitions_override_defaults() {
        let home = TempDir::new().unwrap();
        fs::write(
            home.path().join("solvers.json"),
            r#"{"solvers": [{"name": "only-one", "executable": "sh", "args": ["-c", "echo sat"]}]}"#,
        )
        .unwrap();

        let catalog = Catalog::load(home.path()).unwrap();
        assert_eq!(catalog.definitions().len(), 1);
        assert_eq!(catalog.definitions()[0].name, "only-one");
    }

    #[test]
    fn missing_user_file_falls_back_to_defaults() {
        let home = TempDir::new().unwrap();
        let catalog = Catalog::load(home.path()).unwrap();
        assert!(catalog.definitions().len() >= 5);
    }
}
