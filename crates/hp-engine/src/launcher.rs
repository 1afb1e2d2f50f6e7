//! Training-binary invocation and process spawning.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use hp_types::{Candidate, TrialError, TrialId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::process::{ChildProcess, TrialProcess};

/// How the external training binary is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerCommand {
    /// Training binary (looked up on `PATH` if not a path).
    pub program: String,
    /// Trainer configuration file passed as the first argument.
    pub trainer_config: PathBuf,
    /// Environment executable passed with `--env`.
    pub env_path: PathBuf,
    /// Each slot listens on `base_port + slot`.
    pub base_port: u16,
    pub time_scale: f64,
    /// Flags placed before `--env-args`.
    pub extra_flags: Vec<String>,
    /// Flag names (without the leading `--`) for parameters whose flag is not
    /// simply the name with `_` replaced by `-`.
    pub param_flags: BTreeMap<String, String>,
    pub log_file_flag: String,
}

impl Default for TrainerCommand {
    fn default() -> Self {
        let mut param_flags = BTreeMap::new();
        param_flags.insert(
            "pop_reward_modifier".to_string(),
            "population-reward-modifier".to_string(),
        );
        Self {
            program: "mlagents-learn".to_string(),
            trainer_config: PathBuf::from("config/chickens.yaml"),
            env_path: PathBuf::from("envs/optimization_test.x86_64"),
            base_port: 5000,
            time_scale: 50.0,
            extra_flags: vec!["--no-graphics".to_string(), "--train".to_string()],
            param_flags,
            log_file_flag: "--log-file".to_string(),
        }
    }
}

impl TrainerCommand {
    pub fn flag_for(&self, name: &str) -> String {
        let flag = self
            .param_flags
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.replace('_', "-"));
        format!("--{flag}")
    }

    pub fn port_for(&self, slot: usize) -> u32 {
        u32::from(self.base_port) + slot as u32
    }

    /// Build the full invocation for `candidate` running in `slot`.
    pub fn invocation(
        &self,
        slot: usize,
        id: &TrialId,
        candidate: &Candidate,
        layout: &RunLayout,
    ) -> Invocation {
        let port = self.port_for(slot);
        let run_name = RunLayout::run_name(id, slot);
        let log_file = layout.log_file(&run_name);
        let output_file = layout.output_file(&run_name);

        let mut args = vec![
            self.trainer_config.display().to_string(),
            "--env".to_string(),
            self.env_path.display().to_string(),
            format!("--run-id={run_name}"),
            format!("--base-port={port}"),
            format!("--time-scale={}", self.time_scale),
        ];
        args.extend(self.extra_flags.iter().cloned());
        args.push("--env-args".to_string());
        for (name, value) in candidate.iter() {
            args.push(self.flag_for(name));
            args.push(value.to_string());
        }
        args.push(self.log_file_flag.clone());
        args.push(log_file.display().to_string());

        Invocation {
            slot,
            port,
            program: self.program.clone(),
            args,
            log_file,
            output_file,
        }
    }
}

/// Where trials write their files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunLayout {
    /// Structured per-trial logs written by the training binary.
    pub log_dir: PathBuf,
    /// Captured stdout/stderr of each trial.
    pub output_dir: PathBuf,
}

impl Default for RunLayout {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            output_dir: PathBuf::from("out_files"),
        }
    }
}

impl RunLayout {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(log_dir: P, output_dir: Q) -> Self {
        Self {
            log_dir: log_dir.as_ref().to_path_buf(),
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }

    /// Per-slot run name. Two slots may hold the same candidate at once, so
    /// the slot is part of every file stem and of the trainer's run id.
    pub fn run_name(id: &TrialId, slot: usize) -> String {
        format!("{id}.slot{slot}")
    }

    pub fn log_file(&self, run_name: &str) -> PathBuf {
        self.log_dir.join(format!("{run_name}.json"))
    }

    pub fn output_file(&self, run_name: &str) -> PathBuf {
        self.output_dir.join(format!("{run_name}.out"))
    }

    /// Create both directories if absent.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.log_dir)?;
        std::fs::create_dir_all(&self.output_dir)
    }
}

/// A fully resolved command line for one trial.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub slot: usize,
    pub port: u32,
    pub program: String,
    pub args: Vec<String>,
    pub log_file: PathBuf,
    pub output_file: PathBuf,
}

impl Invocation {
    /// Space-joined command line, for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Starts trial processes.
pub trait Spawn {
    fn spawn(&self, invocation: &Invocation) -> Result<Box<dyn TrialProcess>, TrialError>;
}

/// Spawns real OS processes with stdout and stderr appended to the
/// invocation's output file.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSpawner;

impl Spawn for ProcessSpawner {
    fn spawn(&self, invocation: &Invocation) -> Result<Box<dyn TrialProcess>, TrialError> {
        let launch_error = |message: String| TrialError::Launch {
            program: invocation.program.clone(),
            message,
        };

        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&invocation.output_file)
            .map_err(|e| {
                launch_error(format!(
                    "cannot open output file {}: {e}",
                    invocation.output_file.display()
                ))
            })?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| launch_error(format!("cannot duplicate output handle: {e}")))?;

        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| launch_error(e.to_string()))?;

        debug!(pid = child.id(), command = %invocation.command_line(), "spawned trial process");
        Ok(Box::new(ChildProcess::new(child)))
    }
}

/// Everything needed to turn a candidate into a running trial process.
#[derive(Debug, Clone)]
pub struct TrialLauncher<S: Spawn> {
    command: TrainerCommand,
    layout: RunLayout,
    spawner: S,
}

impl<S: Spawn> TrialLauncher<S> {
    pub fn new(command: TrainerCommand, layout: RunLayout, spawner: S) -> Self {
        Self {
            command,
            layout,
            spawner,
        }
    }

    pub fn command(&self) -> &TrainerCommand {
        &self.command
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    /// Create directories, resolve the invocation and spawn it.
    pub fn launch(
        &self,
        slot: usize,
        id: &TrialId,
        candidate: &Candidate,
    ) -> Result<(Invocation, Box<dyn TrialProcess>), TrialError> {
        self.layout.ensure_dirs().map_err(|e| TrialError::Launch {
            program: self.command.program.clone(),
            message: format!("cannot create run directories: {e}"),
        })?;
        let invocation = self.command.invocation(slot, id, candidate, &self.layout);
        let process = self.spawner.spawn(&invocation)?;
        Ok((invocation, process))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hp_types::ParameterValue;
    use tempfile::tempdir;

    fn candidate() -> Candidate {
        Candidate::new()
            .with("time_step_modifier", ParameterValue::Float(5e-5))
            .with("reproduction_reward", ParameterValue::Float(0.5))
            .with("pop_reward_modifier", ParameterValue::Float(2e-6))
    }

    #[test]
    fn invocation_matches_trainer_cli() {
        let command = TrainerCommand::default();
        let layout = RunLayout::new("logs", "out_files");
        let candidate = candidate();
        let id = candidate.identifier();

        let invocation = command.invocation(2, &id, &candidate, &layout);
        assert_eq!(invocation.port, 5002);
        assert_eq!(invocation.program, "mlagents-learn");
        assert_eq!(
            invocation.log_file,
            PathBuf::from("logs").join(format!("{id}.slot2.json"))
        );
        assert_eq!(
            invocation.output_file,
            PathBuf::from("out_files").join(format!("{id}.slot2.out"))
        );

        let expected: Vec<String> = [
            "config/chickens.yaml",
            "--env",
            "envs/optimization_test.x86_64",
            format!("--run-id={id}.slot2").as_str(),
            "--base-port=5002",
            "--time-scale=50",
            "--no-graphics",
            "--train",
            "--env-args",
            "--population-reward-modifier",
            "0.000002",
            "--reproduction-reward",
            "0.5",
            "--time-step-modifier",
            "0.00005",
            "--log-file",
            invocation.log_file.display().to_string().as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(invocation.args, expected);
        assert!(invocation.command_line().starts_with("mlagents-learn config/chickens.yaml"));
    }

    #[test]
    fn slots_get_distinct_ports() {
        let command = TrainerCommand::default();
        let ports: Vec<u32> = (0..3).map(|slot| command.port_for(slot)).collect();
        assert_eq!(ports, vec![5000, 5001, 5002]);
    }

    #[test]
    fn same_candidate_in_two_slots_gets_separate_files() {
        let command = TrainerCommand::default();
        let layout = RunLayout::default();
        let candidate = candidate();
        let id = candidate.identifier();

        let first = command.invocation(0, &id, &candidate, &layout);
        let second = command.invocation(1, &id, &candidate, &layout);
        assert_ne!(first.log_file, second.log_file);
        assert_ne!(first.output_file, second.output_file);
        assert!(first.args.contains(&format!("--run-id={id}.slot0")));
        assert!(second.args.contains(&format!("--run-id={id}.slot1")));
    }

    #[test]
    fn missing_binary_is_a_launch_error() {
        let dir = tempdir().unwrap();
        let command = TrainerCommand {
            program: dir.path().join("no-such-trainer").display().to_string(),
            ..Default::default()
        };
        let layout = RunLayout::new(dir.path().join("logs"), dir.path().join("out"));
        let launcher = TrialLauncher::new(command, layout, ProcessSpawner);

        let candidate = candidate();
        let err = launcher
            .launch(0, &candidate.identifier(), &candidate)
            .unwrap_err();
        assert!(matches!(err, TrialError::Launch { .. }));
        // Directories are created even when the launch itself fails.
        assert!(dir.path().join("logs").is_dir());
        assert!(dir.path().join("out").is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn output_is_appended_to_trial_file() {
        use crate::process::ExitState;
        use std::time::{Duration, Instant};

        let dir = tempdir().unwrap();
        let layout = RunLayout::new(dir.path().join("logs"), dir.path().join("out"));
        layout.ensure_dirs().unwrap();
        let run_name = RunLayout::run_name(&candidate().identifier(), 0);
        let output_file = layout.output_file(&run_name);
        std::fs::write(&output_file, "previous run\n").unwrap();

        let invocation = Invocation {
            slot: 0,
            port: 5000,
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo out; echo err 1>&2".to_string()],
            log_file: layout.log_file(&run_name),
            output_file: output_file.clone(),
        };
        let mut process = ProcessSpawner.spawn(&invocation).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while process.try_exit().unwrap() == ExitState::Running && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        let text = std::fs::read_to_string(&output_file).unwrap();
        assert!(text.starts_with("previous run\n"));
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
    }
}
