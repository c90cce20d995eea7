use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cxrloc::eval::{count_segmentations, peak_points, precision_recall_specificity, tune_thresholds};
use cxrloc::io;
use cxrloc::params::{NegativePolicy, Smoothing};
use cxrloc::{
    annotations_to_segmentations, bootstrap, compare, heatmaps_to_segmentations, Config,
    LocalizationEval, Manifest, Metric, Prediction, SegmentationSet,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cxrloc")]
#[command(
    about = "Chest X-ray localization: build segmentations from heatmaps or annotations and score them with bootstrap confidence intervals"
)]
struct Cli {
    /// JSON run configuration; flags below override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tasks to process (comma-separated)
    #[arg(long, global = true, value_delimiter = ',')]
    tasks: Option<Vec<String>>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rasterize human polygon annotations into a segmentation JSON
    Annotations {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Where to write the processed/skipped manifest
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Threshold a directory of heatmap records into a segmentation JSON
    Heatmaps {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Per-task fixed thresholds (`task,threshold`); Otsu otherwise
        #[arg(long)]
        thresholds: Option<PathBuf>,
        /// Probability-cutoff sweep (`task,prob_threshold,mIoU`)
        #[arg(long)]
        prob_cutoffs: Option<PathBuf>,
        /// Box-filter the false-colour map before Otsu
        #[arg(long)]
        smoothing: bool,
        /// Box-filter kernel size; only used with --smoothing
        #[arg(long)]
        kernel: Option<u32>,
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Pick the fixed threshold with the best mIoU per task
    Tune {
        #[arg(long)]
        dir: PathBuf,
        /// Ground-truth segmentation JSON
        #[arg(long)]
        gt: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Saliency peaks of a heatmap directory as a point JSON
    Peaks {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Score predictions against ground truth and bootstrap the per-task means
    Evaluate {
        #[arg(long)]
        gt: PathBuf,
        /// Predicted segmentation JSON
        #[arg(long, conflicts_with = "pred_points", required_unless_present = "pred_points")]
        pred: Option<PathBuf>,
        /// Predicted point JSON (hit/miss only)
        #[arg(long)]
        pred_points: Option<PathBuf>,
        #[arg(long)]
        out_dir: PathBuf,
        /// iou or hitmiss
        #[arg(long)]
        metric: Option<Metric>,
        /// Also score pairs whose ground truth is empty
        #[arg(long)]
        all_pairs: bool,
        /// With --all-pairs, leave negative pairs out instead of scoring them
        #[arg(long, requires = "all_pairs")]
        exclude_negatives: bool,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        replicates: Option<usize>,
    },
    /// Percentage decrease of a method from the human benchmark
    PctDecrease {
        /// Benchmark replicate CSV
        #[arg(long)]
        hb: PathBuf,
        /// Method replicate CSV
        #[arg(long)]
        pred: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Number of non-empty masks per task
    Count {
        #[arg(long)]
        seg: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Precision, recall and specificity of mask presence against ground truth
    Prs {
        #[arg(long)]
        gt: PathBuf,
        #[arg(long)]
        pred: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.tasks)?;

    match cli.command {
        Command::Annotations {
            input,
            output,
            manifest,
        } => {
            let annotations = io::read_annotations(&input)
                .with_context(|| format!("Failed to load annotations from {:?}", input))?;
            let batch = annotations_to_segmentations(&annotations, &config.segment_params(None, None));
            write_segmentations(&output, &batch.output)?;
            finish(&batch.manifest, manifest.as_deref())?;
        }
        Command::Heatmaps {
            dir,
            output,
            thresholds,
            prob_cutoffs,
            smoothing,
            kernel,
            manifest,
        } => {
            let thresholds = thresholds
                .map(|p| io::read_thresholds(&p).with_context(|| format!("Failed to read {:?}", p)))
                .transpose()?;
            let cutoffs = prob_cutoffs
                .map(|p| io::read_prob_cutoffs(&p).with_context(|| format!("Failed to read {:?}", p)))
                .transpose()?;
            let mut params = config.segment_params(thresholds, cutoffs);
            if smoothing {
                params.smoothing = Smoothing::new(kernel.unwrap_or(params.smoothing.kernel));
            } else if kernel.is_some() {
                warn!("--kernel has no effect without --smoothing");
            }

            let units = io::read_heatmap_dir(&dir)
                .with_context(|| format!("Failed to read heatmaps from {:?}", dir))?;
            let batch = heatmaps_to_segmentations(&units.output, &params);
            write_segmentations(&output, &batch.output)?;
            let mut report = batch.manifest;
            report.merge_skipped(units.manifest);
            finish(&report, manifest.as_deref())?;
        }
        Command::Tune {
            dir,
            gt,
            output,
            manifest,
        } => {
            let units = io::read_heatmap_dir(&dir)
                .with_context(|| format!("Failed to read heatmaps from {:?}", dir))?;
            let gt = read_segmentations(&gt)?;
            let batch = tune_thresholds(&units.output, &gt, &config.tasks)?;
            io::write_thresholds(&output, &batch.output)
                .with_context(|| format!("Failed to write {:?}", output))?;
            info!(tasks = batch.output.len(), "wrote {:?}", output);
            let mut report = batch.manifest;
            report.merge_skipped(units.manifest);
            finish(&report, manifest.as_deref())?;
        }
        Command::Peaks {
            dir,
            output,
            manifest,
        } => {
            let units = io::read_heatmap_dir(&dir)
                .with_context(|| format!("Failed to read heatmaps from {:?}", dir))?;
            let batch = peak_points(&units.output);
            io::write_json(&output, &batch.output)
                .with_context(|| format!("Failed to write {:?}", output))?;
            let mut report = batch.manifest;
            report.merge_skipped(units.manifest);
            finish(&report, manifest.as_deref())?;
        }
        Command::Evaluate {
            gt,
            pred,
            pred_points,
            out_dir,
            metric,
            all_pairs,
            exclude_negatives,
            seed,
            replicates,
        } => {
            let mut params = config.eval_params();
            if let Some(metric) = metric {
                params.metric = metric;
            }
            if all_pairs {
                params.true_pos_only = false;
            }
            if exclude_negatives {
                params.negatives = NegativePolicy::Exclude;
            }
            let mut bs = config.bootstrap;
            if let Some(seed) = seed {
                bs.seed = seed;
            }
            if let Some(replicates) = replicates {
                bs.replicates = replicates;
            }

            let gt = read_segmentations(&gt)?;
            let masks;
            let points;
            let prediction = match (&pred, &pred_points) {
                (Some(p), _) => {
                    masks = read_segmentations(p)?;
                    Prediction::Masks(&masks)
                }
                (None, Some(p)) => {
                    points = io::read_points(p)
                        .with_context(|| format!("Failed to load points from {:?}", p))?;
                    Prediction::Points(&points)
                }
                (None, None) => bail!("one of --pred or --pred-points is required"),
            };

            let metric = params.metric;
            let tasks = params.tasks.clone();
            let batch = LocalizationEval::new(&gt, prediction, params).evaluate()?;
            let results = bootstrap(&batch.output, &tasks, &bs)?;

            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("Failed to create {:?}", out_dir))?;
            let name = metric.column_name();
            io::write_metric_records(
                &out_dir.join(format!("{}_results_per_cxr.csv", name)),
                &batch.output,
                metric,
            )?;
            io::write_bootstrap_samples(
                &out_dir.join(format!("{}_bootstrap_results_per_cxr.csv", name)),
                &results,
            )?;
            io::write_summary(
                &out_dir.join(format!("{}_summary_results.csv", metric.summary_name())),
                &results,
            )?;
            for r in &results {
                info!(
                    task = %r.task,
                    lower = r.summary.lower,
                    mean = r.summary.mean,
                    upper = r.summary.upper,
                    "{}",
                    metric.summary_name()
                );
            }
            finish(&batch.manifest, Some(&out_dir.join("manifest.json")))?;
        }
        Command::PctDecrease { hb, pred, output } => {
            let hb_samples = io::read_bootstrap_samples(&hb)
                .with_context(|| format!("Failed to read {:?}", hb))?;
            let pred_samples = io::read_bootstrap_samples(&pred)
                .with_context(|| format!("Failed to read {:?}", pred))?;
            let rows = compare(&hb_samples, &pred_samples, config.bootstrap.alpha)?;
            io::write_pct_decrease(&output, &rows)
                .with_context(|| format!("Failed to write {:?}", output))?;
        }
        Command::Count {
            seg,
            output,
            manifest,
        } => {
            let set = read_segmentations(&seg)?;
            let batch = count_segmentations(&set, &config.tasks);
            io::write_segment_counts(&output, &batch.output)
                .with_context(|| format!("Failed to write {:?}", output))?;
            finish(&batch.manifest, manifest.as_deref())?;
        }
        Command::Prs {
            gt,
            pred,
            output,
            manifest,
        } => {
            let gt = read_segmentations(&gt)?;
            let pred = read_segmentations(&pred)?;
            let batch = precision_recall_specificity(&gt, &pred, &config.tasks);
            io::write_label_stats(&output, &batch.output)
                .with_context(|| format!("Failed to write {:?}", output))?;
            finish(&batch.manifest, manifest.as_deref())?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>, tasks: Option<Vec<String>>) -> Result<Config> {
    let mut config = match path {
        Some(p) => Config::from_path(p).with_context(|| format!("Failed to load config {:?}", p))?,
        None => Config::default(),
    };
    if let Some(mut tasks) = tasks {
        tasks.sort();
        tasks.dedup();
        config.tasks = tasks;
    }
    Ok(config)
}

fn read_segmentations(path: &Path) -> Result<SegmentationSet> {
    io::read_segmentations(path).with_context(|| format!("Failed to load segmentations from {:?}", path))
}

fn write_segmentations(path: &Path, set: &SegmentationSet) -> Result<()> {
    io::write_segmentations(path, set).with_context(|| format!("Failed to write {:?}", path))
}

fn finish(manifest: &Manifest, path: Option<&Path>) -> Result<()> {
    info!(
        processed = manifest.processed,
        filtered = manifest.filtered,
        skipped = manifest.skipped.len(),
        "done"
    );
    if let Some(path) = path {
        io::write_manifest(path, manifest).with_context(|| format!("Failed to write {:?}", path))?;
    }
    Ok(())
}
