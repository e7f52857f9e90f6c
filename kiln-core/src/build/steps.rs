// kiln-core/src/build/steps.rs
// Executes a formula's typed install/test steps.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use kiln_common::error::{KilnError, Result};
use kiln_common::model::{BuildStep, OptionSet, StepAction, StepArg};
use tracing::{debug, error, instrument};

use super::env::BuildEnvironment;
use crate::process::{output_tail, run_command_sync};

const FAILURE_TAIL_LINES: usize = 20;

/// Expands `{placeholder}`s in a step template. `{{` and `}}` stand for
/// literal braces; unknown placeholders are an error.
pub fn expand_template(template: &str, env: &BuildEnvironment) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            return Err(unbalanced(template));
        }
        let close = tail.find('}').ok_or_else(|| unbalanced(template))?;
        out.push_str(&placeholder(&tail[1..close], env)?);
        rest = &tail[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn unbalanced(template: &str) -> KilnError {
    KilnError::InstallFailure(format!("Unbalanced braces in step template '{template}'"))
}

fn placeholder(name: &str, env: &BuildEnvironment) -> Result<String> {
    let prefix = env.prefix();
    let value = match name {
        "prefix" => prefix.display().to_string(),
        "bin" => prefix.join("bin").display().to_string(),
        "lib" => prefix.join("lib").display().to_string(),
        "include" => prefix.join("include").display().to_string(),
        "share" => prefix.join("share").display().to_string(),
        "cc" => env.cc().to_string(),
        "cxx" => env.cxx().to_string(),
        "make_jobs" => env.make_jobs().to_string(),
        "buildpath" => env.build_dir().display().to_string(),
        other => match other.strip_prefix("opt:") {
            Some(dep) => env
                .dependency_keg(dep)
                .map(|p| p.display().to_string())
                .ok_or_else(|| {
                    KilnError::InstallFailure(format!(
                        "'{{opt:{dep}}}' names a formula that is not a dependency"
                    ))
                })?,
            None => {
                return Err(KilnError::InstallFailure(format!(
                    "Unknown placeholder '{{{other}}}' in step template"
                )))
            }
        },
    };
    Ok(value)
}

fn expand_args(args: &[StepArg], options: &OptionSet, env: &BuildEnvironment) -> Result<Vec<String>> {
    args.iter()
        .filter(|a| a.is_active(options))
        .map(|a| expand_template(a.template(), env))
        .collect()
}

/// `path` resolved against `base`, refusing anything that climbs out of it.
fn contained_path(base: &Path, path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    let relative = if candidate.is_absolute() {
        candidate.strip_prefix(base).map_err(|_| {
            KilnError::InstallFailure(format!(
                "Path '{}' is outside {}",
                path,
                base.display()
            ))
        })?
    } else {
        candidate
    };
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(KilnError::InstallFailure(format!(
            "Path '{}' escapes {}",
            path,
            base.display()
        )));
    }
    Ok(base.join(relative))
}

/// Runs the active steps of `steps` in order, appending every command's
/// captured output to `log`. The first failing step aborts the sequence.
pub struct StepRunner<'a> {
    env: &'a BuildEnvironment,
    options: &'a OptionSet,
    log: Option<File>,
}

impl<'a> StepRunner<'a> {
    pub fn new(env: &'a BuildEnvironment, options: &'a OptionSet, log_path: Option<&Path>) -> Result<Self> {
        let log = match log_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                Some(OpenOptions::new().create(true).append(true).open(path)?)
            }
            None => None,
        };
        Ok(Self { env, options, log })
    }

    pub fn run_all<F>(&mut self, steps: &[BuildStep], mut on_step: F) -> Result<usize>
    where
        F: FnMut(&BuildStep),
    {
        let mut ran = 0;
        for step in steps.iter().filter(|s| s.is_active(self.options)) {
            on_step(step);
            self.run(step)?;
            ran += 1;
        }
        Ok(ran)
    }

    #[instrument(skip_all, fields(step = %step.describe()))]
    pub fn run(&mut self, step: &BuildStep) -> Result<()> {
        let cwd = match &step.cwd {
            Some(dir) => contained_path(self.env.build_dir(), &expand_template(dir, self.env)?)?,
            None => self.env.build_dir().to_path_buf(),
        };
        let (program, args) = match &step.action {
            StepAction::Configure { script, args } => {
                let mut full = vec![format!("--prefix={}", self.env.prefix().display())];
                full.extend(expand_args(args, self.options, self.env)?);
                (expand_template(script, self.env)?, full)
            }
            StepAction::Make { args } => {
                let mut full = vec![format!("-j{}", self.env.make_jobs())];
                full.extend(expand_args(args, self.options, self.env)?);
                ("make".to_string(), full)
            }
            StepAction::Run { program, args } => (
                expand_template(program, self.env)?,
                expand_args(args, self.options, self.env)?,
            ),
            StepAction::WriteFile {
                path,
                content,
                append,
            } => return self.write_file(&cwd, path, content, *append),
        };
        self.exec(&program, &args, &cwd, step)
    }

    fn exec(&mut self, program: &str, args: &[String], cwd: &Path, step: &BuildStep) -> Result<()> {
        // Relative programs like ./configure resolve against the step's cwd.
        let program = if program.contains('/') && Path::new(program).is_relative() {
            cwd.join(program).display().to_string()
        } else {
            program.to_string()
        };
        self.log_line(&format!("==> {} {}", program, args.join(" ")));
        let output = run_command_sync(&program, args, Some(cwd), Some(self.env.vars()))
            .map_err(|e| KilnError::InstallFailure(format!("{}: {}", step.describe(), e)))?;
        if let Some(log) = self.log.as_mut() {
            log.write_all(&output.stdout)?;
            log.write_all(&output.stderr)?;
        }
        if output.status.success() {
            debug!("Step '{}' succeeded", step.describe());
            return Ok(());
        }
        let mut tail = output_tail(&output.stderr, FAILURE_TAIL_LINES);
        if tail.is_empty() {
            tail = output_tail(&output.stdout, FAILURE_TAIL_LINES);
        }
        error!("Step '{}' failed with {}", step.describe(), output.status);
        Err(KilnError::InstallFailure(format!(
            "step '{}' failed with {}{}{}",
            step.describe(),
            output.status,
            if tail.is_empty() { "" } else { ":\n" },
            tail
        )))
    }

    fn write_file(&mut self, cwd: &Path, path: &str, content: &str, append: bool) -> Result<()> {
        let expanded = expand_template(path, self.env)?;
        let target = if Path::new(&expanded).starts_with(self.env.prefix()) {
            contained_path(self.env.prefix(), &expanded)?
        } else {
            contained_path(cwd, &expanded)?
        };
        let content = expand_template(content, self.env)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        self.log_line(&format!("==> write {}", target.display()));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&target)?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }

    fn log_line(&mut self, line: &str) {
        debug!("{}", line);
        if let Some(log) = self.log.as_mut() {
            let _ = writeln!(log, "{line}");
        }
    }
}
