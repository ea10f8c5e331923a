//! `rig`: run compression trials and process their photos.
//!
//! # Commands
//!
//! - `rig seed-defaults` - Insert the default settings rows
//! - `rig create-trial` - Register a specimen or fixture trial
//! - `rig simulate-trial` - Run a trial on the simulated rig
//! - `rig process-trial` - Build point clouds and meshes for trials
//! - `rig plane-colors` - Calibrate platen colours from a point cloud
//! - `rig status` - Show acquisition and processing progress
//!
//! State is kept in the JSON snapshot named by `store.snapshot_path` and
//! written back after every command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use compression_rig::acquisition::{RunOutcome, StepController, TrialRunner};
use compression_rig::config::RigConfig;
use compression_rig::hardware::mock::{SimulatedActuator, SimulatedCameras, SimulatedForceSensor};
use compression_rig::hardware::RigHardware;
use compression_rig::logging::init_tracing;
use compression_rig::model::{NewTrial, NewTrialSubject, SettingId, StepId, TrialId};
use compression_rig::pipeline::{
    determine_plane_colors, process_trials, AssetPipeline, CommandTools, MockTools, PipelineConfig,
    ReconstructionTools,
};
use compression_rig::status::{render_table, trial_status};
use compression_rig::store::{seed_defaults, MemoryStore, RecordStore};
use compression_rig::transport::{self, LocalTransport};

#[derive(Parser)]
#[command(name = "rig")]
#[command(about = "Compression rig trial control and reconstruction", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to config/rig.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert the default row of every settings table and print the ids
    SeedDefaults,

    /// Register a trial for a new specimen or calibration fixture
    CreateTrial {
        #[arg(long)]
        name: String,

        #[arg(long, default_value_t = 0.5)]
        strain_limit: f64,

        #[arg(long, default_value_t = 0.05)]
        strain_delta: f64,

        #[arg(long, default_value_t = 1000.0)]
        force_limit: f64,

        /// Frames kept per step (0 keeps all)
        #[arg(long, default_value_t = 100)]
        frames_per_step: u32,

        /// Specimen name; creates the specimen row
        #[arg(long, conflicts_with = "fixture")]
        specimen: Option<String>,

        /// Fixture name; creates the fixture row and makes this a calibration trial
        #[arg(long, requires = "fixture_volume")]
        fixture: Option<String>,

        /// Known fixture volume in mm^3
        #[arg(long)]
        fixture_volume: Option<f64>,
    },

    /// Run a trial on the simulated rig
    SimulateTrial {
        #[arg(long)]
        trial: i64,

        #[arg(long)]
        camera_setting: i64,
    },

    /// Build all derived assets for one or more trials
    ProcessTrial {
        #[arg(long = "trial", required = true)]
        trials: Vec<i64>,

        #[command(flatten)]
        ids: ConfigIds,

        /// Use the built-in placeholder tools instead of the configured executables
        #[arg(long)]
        mock_tools: bool,
    },

    /// Measure platen colours in a step's full point cloud
    PlaneColors {
        #[arg(long)]
        step: i64,

        #[arg(long, default_value_t = 2)]
        plane_limit: u32,

        #[command(flatten)]
        ids: ConfigIds,

        #[arg(long)]
        mock_tools: bool,
    },

    /// Show acquisition and processing progress
    Status {
        #[arg(long = "trial", required = true)]
        trials: Vec<i64>,
    },
}

/// Settings row ids of a pipeline run.
#[derive(Args)]
struct ConfigIds {
    #[arg(long)]
    ply_generation: i64,
    #[arg(long)]
    ply_export: i64,
    #[arg(long)]
    crop_color: i64,
    #[arg(long)]
    segmentation: i64,
    #[arg(long)]
    clustering: i64,
    #[arg(long)]
    platen_dimensions: i64,
    #[arg(long)]
    face_color: i64,
    #[arg(long)]
    side_color: i64,
    #[arg(long)]
    mesh_export: i64,
    #[arg(long)]
    scaling_correction: i64,
}

impl From<&ConfigIds> for PipelineConfig {
    fn from(ids: &ConfigIds) -> Self {
        PipelineConfig {
            ply_generation: SettingId(ids.ply_generation),
            ply_export: SettingId(ids.ply_export),
            crop_color: SettingId(ids.crop_color),
            segmentation: SettingId(ids.segmentation),
            clustering: SettingId(ids.clustering),
            platen_dimensions: SettingId(ids.platen_dimensions),
            face_color: SettingId(ids.face_color),
            side_color: SettingId(ids.side_color),
            mesh_export: SettingId(ids.mesh_export),
            scaling_correction: SettingId(ids.scaling_correction),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RigConfig::load_from(path),
        None => RigConfig::load(),
    }
    .context("loading configuration")?;
    init_tracing(&config.application);

    let snapshot = config.store.snapshot_path.clone();
    let store = Arc::new(MemoryStore::open(&snapshot).await?);
    let result = run(cli.command, &config, store.clone()).await;
    store
        .save(&snapshot)
        .await
        .with_context(|| format!("saving {}", snapshot.display()))?;
    result
}

async fn run(command: Commands, config: &RigConfig, store: Arc<MemoryStore>) -> Result<()> {
    let records: Arc<dyn RecordStore> = store;
    match command {
        Commands::SeedDefaults => {
            let ids = seed_defaults(records.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&ids)?);
        }
        Commands::CreateTrial {
            name,
            strain_limit,
            strain_delta,
            force_limit,
            frames_per_step,
            specimen,
            fixture,
            fixture_volume,
        } => {
            let subject = match (specimen, fixture) {
                (_, Some(fixture)) => {
                    let volume = fixture_volume.context("--fixture needs --fixture-volume")?;
                    let row = records.create_fixture(&fixture, volume, "mm").await?;
                    NewTrialSubject::Fixture(row.id)
                }
                (Some(specimen), None) => {
                    let row = records.create_specimen(&specimen, "mm").await?;
                    NewTrialSubject::Specimen(row.id)
                }
                (None, None) => anyhow::bail!("one of --specimen or --fixture is required"),
            };
            let trial = records
                .create_trial(NewTrial {
                    name,
                    strain_limit,
                    strain_delta,
                    force_limit,
                    force_unit: "N".into(),
                    subject,
                    frames_per_step,
                })
                .await?;
            println!("created trial {} ({})", trial.id, trial.name);
        }
        Commands::SimulateTrial {
            trial,
            camera_setting,
        } => {
            let sim = &config.simulation;
            let actuator = Arc::new(SimulatedActuator::from_config(sim));
            let force = Arc::new(SimulatedForceSensor::spring(actuator.clone(), sim));
            let cameras = Arc::new(SimulatedCameras::from_config(sim));
            let hardware = RigHardware::new(actuator, force, cameras);

            let mut controller = StepController::new(
                hardware,
                records.clone(),
                transport::from_config(&config.transport),
                config.rig.clone(),
                config.acquisition.clone(),
                config.transport.storage_root.clone(),
                config.transport.timeout(),
            );
            if let Some(seed) = sim.seed {
                controller = controller.with_rng(StdRng::seed_from_u64(seed));
            }

            let mut runner = TrialRunner::new(controller);
            match runner.run(TrialId(trial), SettingId(camera_setting)).await? {
                RunOutcome::Completed(report) => {
                    println!(
                        "trial {} complete: {} steps, force zero {:.3}{}",
                        report.trial_id,
                        report.steps.len(),
                        report.force_zero,
                        if report.stopped_by_force_limit {
                            ", stopped at the force limit"
                        } else {
                            ""
                        }
                    );
                }
                RunOutcome::NotRunnable { trial_id, reason } => {
                    println!("trial {trial_id} not runnable: {reason}");
                }
            }
        }
        Commands::ProcessTrial {
            trials,
            ids,
            mock_tools,
        } => {
            let pipeline = build_pipeline(config, records, mock_tools);
            let trial_ids: Vec<TrialId> = trials.into_iter().map(TrialId).collect();
            let results = process_trials(
                &pipeline,
                &trial_ids,
                &PipelineConfig::from(&ids),
                config.pipeline.concurrency,
            )
            .await;
            for (trial_id, result) in results {
                match result {
                    Ok(report) => println!(
                        "trial {trial_id}: {}/{} steps complete, {} failed",
                        report.completed_steps(),
                        report.steps.len(),
                        report.failed_steps()
                    ),
                    Err(e) => println!("trial {trial_id}: {e}"),
                }
            }
        }
        Commands::PlaneColors {
            step,
            plane_limit,
            ids,
            mock_tools,
        } => {
            let pipeline = build_pipeline(config, records, mock_tools);
            let ids = determine_plane_colors(
                &pipeline,
                StepId(step),
                &PipelineConfig::from(&ids),
                plane_limit,
            )
            .await?;
            let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
            println!("colour settings: {}", ids.join(", "));
        }
        Commands::Status { trials } => {
            let trial_ids: Vec<TrialId> = trials.into_iter().map(TrialId).collect();
            let statuses = trial_status(records.as_ref(), &trial_ids).await?;
            print!("{}", render_table(&statuses));
        }
    }
    Ok(())
}

fn build_pipeline(config: &RigConfig, store: Arc<dyn RecordStore>, mock_tools: bool) -> AssetPipeline {
    let tools: Arc<dyn ReconstructionTools> = if mock_tools {
        Arc::new(MockTools::new())
    } else {
        Arc::new(CommandTools::new(config.pipeline.tools.clone()))
    };
    info!(mock_tools, "pipeline tools selected");
    AssetPipeline::new(
        store,
        tools,
        Arc::new(LocalTransport::new()),
        &config.pipeline,
        config.transport.timeout(),
    )
}
