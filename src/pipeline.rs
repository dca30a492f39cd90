//! Pipeline engine.
//!
//! Resolves every manifest entry to a stage, validates all of them before
//! touching the filesystem, then drives each stage through its lifecycle in
//! manifest order. The first failure stops the build; nothing already done
//! is rolled back.

use std::sync::Arc;

use tracing::info_span;

use crate::config::BuilderConfig;
use crate::error::{display_chain, BuildError, Phase};
use crate::manifest::{Manifest, StageSpec};
use crate::process::{CommandRunner, HostRunner};
use crate::report::{now_utc_compact, write_report, BuildReport, StageRecord};
use crate::stage::{Stage, StageContext, StageRegistry};
use crate::workspace::Workspace;

/// A resolved manifest entry.
pub struct PlannedStage {
    /// 1-based manifest position.
    pub index: usize,
    pub spec: StageSpec,
    stage: Box<dyn Stage>,
}

pub struct Pipeline {
    config: BuilderConfig,
    registry: StageRegistry,
    runner: Arc<dyn CommandRunner>,
}

impl Pipeline {
    /// Pipeline with the built-in stage kinds, running tools on the host.
    pub fn new(config: BuilderConfig) -> Self {
        Self {
            config,
            registry: StageRegistry::with_builtins(),
            runner: Arc::new(HostRunner),
        }
    }

    pub fn with_registry(mut self, registry: StageRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn workspace_for(&self, manifest: &Manifest) -> Workspace {
        Workspace::new(&self.config.workspace, &manifest.name)
    }

    /// Validate the manifest and every stage's options without side effects.
    pub fn check(&self, manifest: &Manifest) -> Result<Vec<PlannedStage>, BuildError> {
        manifest.verify()?;
        manifest
            .stages
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let index = i + 1;
                let stage = self
                    .registry
                    .create(&spec.stage, &spec.options)
                    .map_err(|e| BuildError::Stage {
                        index,
                        kind: spec.stage.clone(),
                        phase: Phase::Load,
                        source: e.into(),
                    })?;
                Ok(PlannedStage {
                    index,
                    spec: spec.clone(),
                    stage,
                })
            })
            .collect()
    }

    /// Build the artifact described by `manifest`.
    pub fn run(&self, manifest: &Manifest) -> Result<BuildReport, BuildError> {
        let mut planned = self.check(manifest)?;

        let workspace = self.workspace_for(manifest);
        tracing::info!("Setting up workspace: {}", workspace.root().display());
        workspace.create().map_err(BuildError::Workspace)?;
        if let Some(source_dir) = &manifest.source_dir {
            tracing::info!("Copying {} into workspace", source_dir.display());
            workspace
                .import_sources(source_dir)
                .map_err(BuildError::Workspace)?;
        }

        let mut report = BuildReport {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            architecture: manifest.architecture.to_string(),
            status: "running".to_string(),
            started_at_utc: now_utc_compact(),
            finished_at_utc: None,
            error: None,
            stages: planned
                .iter()
                .map(|p| StageRecord::pending(p.index, &p.spec.stage, p.spec.name.as_deref()))
                .collect(),
        };

        let ctx = StageContext::new(&workspace, &*self.runner, manifest.architecture);
        let outcome = self.execute(&ctx, &mut planned, &mut report.stages);

        report.finished_at_utc = Some(now_utc_compact());
        match &outcome {
            Ok(()) => {
                report.status = "success".to_string();
                tracing::info!("Build of {} finished", manifest.name);
            }
            Err(err) => {
                report.status = "failed".to_string();
                report.error = Some(display_chain(err));
            }
        }

        if self.config.report {
            if let Err(err) = write_report(&workspace.report_path(), &report) {
                tracing::warn!("failed to write build report: {err:#}");
            }
        }

        outcome.map(|()| report)
    }

    fn execute(
        &self,
        ctx: &StageContext<'_>,
        planned: &mut [PlannedStage],
        records: &mut [StageRecord],
    ) -> Result<(), BuildError> {
        let hoisted = self.config.hoist_preflight;

        if hoisted {
            tracing::info!("Running preflight checks for {} stage(s)", planned.len());
            for (p, record) in planned.iter_mut().zip(records.iter_mut()) {
                let span = info_span!("stage", index = p.index, kind = %p.spec.stage);
                let _enter = span.enter();
                lifecycle(p, record, Phase::PreflightCheck, |s| s.preflight_check(ctx))?;
            }
        }

        for (p, record) in planned.iter_mut().zip(records.iter_mut()) {
            let span = info_span!("stage", index = p.index, kind = %p.spec.stage);
            let _enter = span.enter();
            tracing::info!("Running {}", p.spec.label());
            record.start();

            if !hoisted {
                lifecycle(p, record, Phase::PreflightCheck, |s| s.preflight_check(ctx))?;
            }
            lifecycle(p, record, Phase::Run, |s| s.run(ctx))?;
            lifecycle(p, record, Phase::PostInstall, |s| s.post_install(ctx))?;

            record.finish();
        }
        Ok(())
    }
}

fn lifecycle<F>(
    planned: &mut PlannedStage,
    record: &mut StageRecord,
    phase: Phase,
    call: F,
) -> Result<(), BuildError>
where
    F: FnOnce(&mut Box<dyn Stage>) -> anyhow::Result<()>,
{
    tracing::debug!("{} {}", phase, planned.spec.label());
    call(&mut planned.stage).map_err(|source| {
        record.fail(phase);
        let err = BuildError::Stage {
            index: planned.index,
            kind: planned.spec.stage.clone(),
            phase,
            source,
        };
        tracing::error!("{}", display_chain(&err));
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::process::testing::RecordingRunner;
    use crate::process::{Cmd, CommandResult};
    use crate::report::StageStatus;
    use serde::Deserialize;
    use serde_yaml::Value;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    type CallLog = Arc<Mutex<Vec<String>>>;

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct ProbeOptions {
        id: String,
        #[serde(default)]
        fail: Option<String>,
    }

    struct Probe {
        opts: ProbeOptions,
        log: CallLog,
    }

    impl Probe {
        fn record(&self, phase: &str) -> anyhow::Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.opts.id, phase));
            if self.opts.fail.as_deref() == Some(phase) {
                anyhow::bail!("{} failed in {}", self.opts.id, phase);
            }
            Ok(())
        }
    }

    impl Stage for Probe {
        fn preflight_check(&mut self, _ctx: &StageContext<'_>) -> anyhow::Result<()> {
            self.record("preflight")
        }

        fn run(&mut self, ctx: &StageContext<'_>) -> anyhow::Result<()> {
            fs::write(ctx.workspace.root().join(&self.opts.id), "done")?;
            self.record("run")
        }

        fn post_install(&mut self, _ctx: &StageContext<'_>) -> anyhow::Result<()> {
            self.record("post")
        }
    }

    fn registry(log: &CallLog) -> StageRegistry {
        let mut registry = StageRegistry::empty();
        let log = log.clone();
        registry.register("probe", "records lifecycle calls", move |options| {
            let opts: ProbeOptions = serde_yaml::from_value(options.clone())
                .map_err(|e| BuildError::Schema {
                    kind: "probe".into(),
                    violations: vec![e.to_string()],
                })?;
            Ok(Box::new(Probe {
                opts,
                log: log.clone(),
            }))
        });
        registry
    }

    fn probe(id: &str, fail: Option<&str>) -> StageSpec {
        let mut yaml = format!("id: {id}\n");
        if let Some(phase) = fail {
            yaml.push_str(&format!("fail: {phase}\n"));
        }
        StageSpec::new("probe", serde_yaml::from_str::<Value>(&yaml).unwrap())
    }

    fn manifest(stages: Vec<StageSpec>) -> Manifest {
        Manifest {
            name: "demo".into(),
            architecture: crate::manifest::Architecture::Amd64,
            version: "1.0".into(),
            schema_version: 1,
            stages,
            source_dir: None,
        }
    }

    fn pipeline(base: &TempDir, log: &CallLog, hoist: bool) -> Pipeline {
        let config = BuilderConfig {
            workspace: base.path().to_path_buf(),
            hoist_preflight: hoist,
            report: true,
        };
        Pipeline::new(config)
            .with_registry(registry(log))
            .with_runner(Arc::new(RecordingRunner::new()))
    }

    fn calls(log: &CallLog) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn test_hoisted_lifecycle_order() {
        let base = TempDir::new().unwrap();
        let log = CallLog::default();
        let m = manifest(vec![probe("a", None), probe("b", None)]);

        let report = pipeline(&base, &log, true).run(&m).unwrap();
        assert!(report.succeeded());
        assert_eq!(
            calls(&log),
            vec![
                "a:preflight",
                "b:preflight",
                "a:run",
                "a:post",
                "b:run",
                "b:post"
            ]
        );
    }

    #[test]
    fn test_unhoisted_lifecycle_order() {
        let base = TempDir::new().unwrap();
        let log = CallLog::default();
        let m = manifest(vec![probe("a", None), probe("b", None)]);

        pipeline(&base, &log, false).run(&m).unwrap();
        assert_eq!(
            calls(&log),
            vec![
                "a:preflight",
                "a:run",
                "a:post",
                "b:preflight",
                "b:run",
                "b:post"
            ]
        );
    }

    #[test]
    fn test_failure_stops_later_stages() {
        let base = TempDir::new().unwrap();
        let log = CallLog::default();
        let m = manifest(vec![
            probe("a", None),
            probe("b", Some("run")),
            probe("c", None),
        ]);

        let err = pipeline(&base, &log, true).run(&m).unwrap_err();
        assert_eq!(err.stage(), Some((2, "probe")));
        assert!(matches!(
            err,
            BuildError::Stage {
                phase: Phase::Run,
                ..
            }
        ));
        let seen = calls(&log);
        assert!(seen.contains(&"b:run".to_string()));
        assert!(!seen.iter().any(|c| c == "c:run" || c == "b:post"));
        // Stage a's artifact stays.
        assert!(base.path().join("demo/a").exists());
        assert!(!base.path().join("demo/c").exists());
    }

    #[test]
    fn test_post_install_failure_aborts() {
        let base = TempDir::new().unwrap();
        let log = CallLog::default();
        let m = manifest(vec![probe("a", Some("post")), probe("b", None)]);

        let err = pipeline(&base, &log, true).run(&m).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Stage {
                index: 1,
                phase: Phase::PostInstall,
                ..
            }
        ));
        assert!(!calls(&log).contains(&"b:run".to_string()));
    }

    #[test]
    fn test_hoisted_preflight_failure_runs_nothing() {
        let base = TempDir::new().unwrap();
        let log = CallLog::default();
        let m = manifest(vec![probe("a", None), probe("b", Some("preflight"))]);

        pipeline(&base, &log, true).run(&m).unwrap_err();
        assert_eq!(calls(&log), vec!["a:preflight", "b:preflight"]);
    }

    #[test]
    fn test_unknown_kind_fails_before_workspace_exists() {
        let base = TempDir::new().unwrap();
        let log = CallLog::default();
        let m = manifest(vec![
            probe("a", None),
            StageSpec::new("debos", Value::Null),
        ]);

        let err = pipeline(&base, &log, true).run(&m).unwrap_err();
        assert_eq!(err.root_kind(), ErrorKind::Config);
        assert_eq!(err.stage(), Some((2, "debos")));
        assert!(calls(&log).is_empty());
        assert!(!base.path().join("demo").exists());
    }

    #[test]
    fn test_invalid_manifest_fails_before_workspace_exists() {
        let base = TempDir::new().unwrap();
        let log = CallLog::default();
        let mut m = manifest(vec![probe("a", None)]);
        m.schema_version = 2;

        let err = pipeline(&base, &log, true).run(&m).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(!base.path().join("demo").exists());
    }

    #[test]
    fn test_report_records_failure() {
        let base = TempDir::new().unwrap();
        let log = CallLog::default();
        let m = manifest(vec![
            probe("a", None),
            probe("b", Some("run")),
            probe("c", None),
        ]);
        pipeline(&base, &log, true).run(&m).unwrap_err();

        let text = fs::read_to_string(base.path().join("demo/build-report.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["stages"][0]["status"], "succeeded");
        assert_eq!(json["stages"][1]["status"], "failed");
        assert_eq!(json["stages"][1]["failed_phase"], "run");
        assert_eq!(json["stages"][2]["status"], "pending");
        assert!(json["error"].as_str().unwrap().contains("b failed in run"));
    }

    #[test]
    fn test_report_marks_success() {
        let base = TempDir::new().unwrap();
        let log = CallLog::default();
        let report = pipeline(&base, &log, true)
            .run(&manifest(vec![probe("a", None)]))
            .unwrap();
        assert_eq!(
            report.stage(1).map(|s| s.status),
            Some(StageStatus::Succeeded)
        );
        assert!(base.path().join("demo/build-report.json").is_file());
    }

    #[test]
    fn test_sources_copied_into_workspace() {
        let base = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("manifest.yaml"), "name: demo").unwrap();
        let log = CallLog::default();
        let mut m = manifest(vec![probe("a", None)]);
        m.source_dir = Some(src.path().to_path_buf());

        pipeline(&base, &log, true).run(&m).unwrap();
        assert!(base.path().join("demo/manifest.yaml").is_file());
    }

    /// Notes whether the image exists when systemd-repart is invoked.
    struct RepartWatch {
        inner: RecordingRunner,
        image: PathBuf,
        image_present: Mutex<Option<bool>>,
    }

    impl CommandRunner for RepartWatch {
        fn execute(&self, cmd: &Cmd) -> anyhow::Result<CommandResult> {
            if cmd.program() == "systemd-repart" {
                *self.image_present.lock().unwrap() = Some(self.image.exists());
            }
            self.inner.execute(cmd)
        }

        fn which(&self, program: &str) -> Option<PathBuf> {
            self.inner.which(program)
        }
    }

    const BOOTSTRAP_REPART: &str = "\
name: demo
architecture: amd64
version: '1.0'
schemaVersion: 1
stages:
  - stage: bootstrap
    options:
      suite: bookworm
      target: rootfs.tar.gz
  - stage: repart
    options:
      image: disk.img
      size: 2G
      definitions: repart.d
";

    #[test]
    fn test_bootstrap_then_repart_with_builtins() {
        let base = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("repart.d")).unwrap();
        fs::write(
            src.path().join("repart.d/10-root.conf"),
            "[Partition]\nType=root\n",
        )
        .unwrap();
        // Left over from an earlier build; copied in with the sources.
        fs::write(src.path().join("disk.img"), "old image").unwrap();
        let manifest_path = src.path().join("demo.yaml");
        fs::write(&manifest_path, BOOTSTRAP_REPART).unwrap();

        let ws = base.path().join("demo");
        let runner = Arc::new(RepartWatch {
            inner: RecordingRunner::new(),
            image: ws.join("disk.img"),
            image_present: Mutex::new(None),
        });
        let config = BuilderConfig {
            workspace: base.path().to_path_buf(),
            hoist_preflight: true,
            report: true,
        };

        let m = Manifest::load(&manifest_path).unwrap();
        let report = Pipeline::new(config)
            .with_runner(runner.clone())
            .run(&m)
            .unwrap();

        assert!(report.succeeded());
        assert!(ws.is_dir());
        assert!(ws.join("repart.d/10-root.conf").is_file());

        let commands = runner.inner.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[0],
            format!(
                "mmdebstrap --architecture amd64 --verbose bookworm {}",
                ws.join("rootfs.tar.gz").display()
            )
        );
        assert!(commands[1].starts_with(&format!(
            "systemd-repart --definitions {}",
            ws.join("repart.d").display()
        )));
        assert!(commands[1].ends_with(&ws.join("disk.img").display().to_string()));
        assert_eq!(runner.inner.calls()[1].current_dir(), Some(ws.as_path()));
        assert_eq!(*runner.image_present.lock().unwrap(), Some(false));
    }
}
