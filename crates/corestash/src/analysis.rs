//! Best-effort trace extraction for stored cores.
//!
//! One analysis runs per queued document, strictly sequenced: load the
//! document, detect the language from the executable's ELF sections, run
//! the configured debugger template, write the results back. Any failure
//! aborts the remaining stages and leaves the document un-analyzed; the
//! recovery sweep at the next startup retries it.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use corestash_common::Language;
use corestash_elf::ElfInfo;

use crate::index::Index;
use crate::store::Store;

/// Default analyzer command for C-ish binaries.
pub const DEFAULT_C_ANALYZER: &[&str] = &[
    "gdb",
    "--nx",
    "--batch",
    "-x",
    "{data_dir}/gdb.cmd",
    "{executable}",
    "{core}",
];

/// Default analyzer command for Go binaries.
pub const DEFAULT_GO_ANALYZER: &[&str] = &[
    "dlv",
    "core",
    "{executable}",
    "{core}",
    "--init",
    "{data_dir}/delve.cmd",
];

/// Debugger scripts referenced by the default templates, written into the
/// data directory at startup so operators can adjust them.
const SCRIPTS: &[(&str, &str)] = &[
    ("gdb.cmd", "bt full\nquit\n"),
    ("delve.cmd", "bt\nexit\n"),
];

/// Section names that fingerprint a language.
///
/// To support another language, add a probe here and a template in the
/// configuration. First match wins; the fallback is C, which any
/// gdb-debuggable binary is close enough to.
const LANGUAGE_PROBES: &[(&str, Language)] = &[(".go.buildinfo", Language::Go)];

pub fn detect_language(elf: &ElfInfo) -> Language {
    LANGUAGE_PROBES
        .iter()
        .find(|(section, _)| elf.has_section(section))
        .map(|(_, lang)| *lang)
        .unwrap_or(Language::C)
}

/// The per-language analyzer command templates.
///
/// Each template is a list of argv tokens; the `{executable}`, `{core}` and
/// `{data_dir}` placeholders are rendered independently in every token, so
/// paths containing spaces survive.
#[derive(Debug, Clone)]
pub struct AnalyzerTemplates {
    data_dir: PathBuf,
    c: Vec<String>,
    go: Vec<String>,
}

impl AnalyzerTemplates {
    /// Builds the template set and persists the default debugger scripts
    /// into `data_dir` when they are not already there.
    pub fn init(data_dir: &Path, c: Vec<String>, go: Vec<String>) -> std::io::Result<Self> {
        for (name, content) in SCRIPTS {
            let path = data_dir.join(name);
            if !path.exists() {
                std::fs::write(&path, content)?;
            }
        }

        Ok(AnalyzerTemplates {
            data_dir: data_dir.to_path_buf(),
            c,
            go,
        })
    }

    fn get(&self, lang: Language) -> Option<&[String]> {
        let template = match lang {
            Language::C => &self.c,
            Language::Go => &self.go,
        };
        (!template.is_empty()).then_some(template.as_slice())
    }

    fn render(&self, template: &[String], executable: &Path, core: &Path) -> Vec<String> {
        let executable = executable.to_string_lossy();
        let core = core.to_string_lossy();
        let data_dir = self.data_dir.to_string_lossy();
        template
            .iter()
            .map(|token| {
                token
                    .replace("{executable}", &executable)
                    .replace("{core}", &core)
                    .replace("{data_dir}", &data_dir)
            })
            .collect()
    }
}

/// Analyzes one stored core and writes the results back to the index.
///
/// The document is re-read from the index rather than trusted from the
/// queue: write-backs from a concurrent re-analysis or a re-indexed upload
/// must not be overwritten with a stale copy.
pub fn analyze(
    uid: &str,
    store: &dyn Store,
    index: &dyn Index,
    templates: &AnalyzerTemplates,
) -> Result<()> {
    let mut core = index.find(uid).context("finding indexed core")?;

    let mut executable = store
        .executable(&core.executable_hash)
        .context("opening executable")?;
    drop(store.core(&core.uid).context("opening core")?);

    let mut raw = Vec::new();
    executable
        .read_to_end(&mut raw)
        .context("reading executable")?;
    let elf = ElfInfo::parse(store.executable_path(&core.executable_hash), &raw)
        .context("parsing executable")?;

    let lang = detect_language(&elf);
    core.lang = Some(lang);
    tracing::debug!(uid, %lang, "detected language");

    match templates.get(lang) {
        None => {
            tracing::warn!(uid, %lang, "no trace analyzer for language");
        }
        Some(template) => {
            let argv = templates.render(
                template,
                &store.executable_path(&core.executable_hash),
                &store.core_path(&core.uid),
            );
            let trace = extract_stack_trace(&argv).context("extracting stack trace")?;
            core.trace = Some(trace);
        }
    }

    core.analyzed = true;
    core.analyzed_at = Some(Utc::now());
    index.index(&core).context("indexing analysis results")?;

    Ok(())
}

/// Runs the rendered analyzer command and captures its combined output.
fn extract_stack_trace(argv: &[String]) -> Result<String> {
    let Some((program, args)) = argv.split_first() else {
        bail!("empty analyzer command");
    };

    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("running {program:?}"))?;

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    let text = String::from_utf8_lossy(&combined).into_owned();

    if !output.status.success() {
        bail!("analyzer exited with {}: {}", output.status, text.trim());
    }

    Ok(text)
}
