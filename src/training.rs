use anyhow::{bail, Context, Result};
use burn::config::Config;
use burn::lr_scheduler::LrScheduler;
use burn::module::AutodiffModule;
use burn::nn::Initializer;
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{CompactRecorder, Record, Recorder};
use burn::tensor::backend::AutodiffBackend;
use std::f64::consts::{PI, SQRT_2};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// File stem of the rolling checkpoint, overwritten on every save.
pub const LAST_CHECKPOINT: &str = "last";
/// File stem of the best-so-far copy of the rolling checkpoint.
pub const BEST_CHECKPOINT: &str = "best";

/// Default standard deviation / gain for the weight initializers.
pub const DEFAULT_INIT_GAIN: f64 = 0.02;

/// Record bundle persisted per checkpoint: both generators, both
/// discriminators, then the optional generator/discriminator optimizer state.
pub type CycleCheckpoint<G, D, OG, OD> = (((G, G), (D, D)), (Option<OG>, Option<OD>));

fn checkpoint_file(checkpoint_dir: &Path, stem: &str) -> PathBuf {
    checkpoint_dir.join(stem).with_extension("mpk")
}

/// Path of the rolling checkpoint inside `checkpoint_dir`.
pub fn last_checkpoint_path(checkpoint_dir: &Path) -> PathBuf {
    checkpoint_file(checkpoint_dir, LAST_CHECKPOINT)
}

/// Path of the best-so-far checkpoint inside `checkpoint_dir`.
pub fn best_checkpoint_path(checkpoint_dir: &Path) -> PathBuf {
    checkpoint_file(checkpoint_dir, BEST_CHECKPOINT)
}

/// Assemble the caller-owned state bundle for [`save_checkpoint`].
///
/// `s2t`/`t2s` are the source-to-target and target-to-source generators,
/// `d_s`/`d_t` the per-domain discriminators. Optimizer state is included
/// only for the optimizers that are supplied.
pub fn assemble_checkpoint<B, G, D, OG, OD>(
    s2t: &G,
    t2s: &G,
    d_s: &D,
    d_t: &D,
    optim_g: Option<&OG>,
    optim_d: Option<&OD>,
) -> CycleCheckpoint<G::Record, D::Record, OG::Record, OD::Record>
where
    B: AutodiffBackend,
    G: AutodiffModule<B>,
    D: AutodiffModule<B>,
    OG: Optimizer<G, B>,
    OD: Optimizer<D, B>,
{
    (
        (
            (s2t.clone().into_record(), t2s.clone().into_record()),
            (d_s.clone().into_record(), d_t.clone().into_record()),
        ),
        (
            optim_g.map(|optim| optim.to_record()),
            optim_d.map(|optim| optim.to_record()),
        ),
    )
}

/// Serialize a state bundle to `last.mpk`, copying it to `best.mpk` iff
/// `is_best`. Creates `checkpoint_dir` when absent and returns the path of
/// the rolling file.
pub fn save_checkpoint<B: Backend, R: Record<B>>(
    state: R,
    is_best: bool,
    checkpoint_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(checkpoint_dir)
        .with_context(|| format!("failed to create {}", checkpoint_dir.display()))?;

    let last = last_checkpoint_path(checkpoint_dir);
    CompactRecorder::new()
        .record(state, checkpoint_dir.join(LAST_CHECKPOINT))
        .with_context(|| format!("failed to write checkpoint {}", last.display()))?;

    if is_best {
        let best = best_checkpoint_path(checkpoint_dir);
        std::fs::copy(&last, &best)
            .with_context(|| format!("failed to copy checkpoint to {}", best.display()))?;
    }

    Ok(last)
}

/// Restore the four models, and optimizer state for each supplied optimizer,
/// from a checkpoint written by [`save_checkpoint`].
///
/// Fails immediately when `checkpoint_path` does not exist. A malformed or
/// mismatched file surfaces the recorder error; there is no partial-restore
/// recovery.
pub fn load_checkpoint<B, G, D, OG, OD>(
    checkpoint_path: &Path,
    s2t: G,
    t2s: G,
    d_s: D,
    d_t: D,
    optim_g: Option<OG>,
    optim_d: Option<OD>,
    device: &B::Device,
) -> Result<(G, G, D, D, Option<OG>, Option<OD>)>
where
    B: AutodiffBackend,
    G: AutodiffModule<B>,
    D: AutodiffModule<B>,
    OG: Optimizer<G, B>,
    OD: Optimizer<D, B>,
{
    if !checkpoint_path.exists() {
        bail!("checkpoint doesn't exist at {}", checkpoint_path.display());
    }

    let record: CycleCheckpoint<G::Record, D::Record, OG::Record, OD::Record> =
        CompactRecorder::new()
            .load(checkpoint_path.to_path_buf(), device)
            .with_context(|| {
                format!("failed to load checkpoint from {}", checkpoint_path.display())
            })?;
    let ((s2t_record, t2s_record), (d_s_record, d_t_record)) = record.0;
    let (optim_g_record, optim_d_record) = record.1;

    let s2t = s2t.load_record(s2t_record);
    let t2s = t2s.load_record(t2s_record);
    let d_s = d_s.load_record(d_s_record);
    let d_t = d_t.load_record(d_t_record);

    let optim_g = match (optim_g, optim_g_record) {
        (Some(optim), Some(record)) => Some(optim.load_record(record)),
        (optim, _) => optim,
    };
    let optim_d = match (optim_d, optim_d_record) {
        (Some(optim), Some(record)) => Some(optim.load_record(record)),
        (optim, _) => optim,
    };

    Ok((s2t, t2s, d_s, d_t, optim_g, optim_d))
}

/// Weight initialization policy, selected once for a whole model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPolicy {
    Normal,
    Xavier,
    Kaiming,
    Orthogonal,
}

impl FromStr for InitPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "normal" => Ok(InitPolicy::Normal),
            "xavier" => Ok(InitPolicy::Xavier),
            "kaiming" => Ok(InitPolicy::Kaiming),
            "orthogonal" => Ok(InitPolicy::Orthogonal),
            other => bail!("initialization method [{other}] is not implemented"),
        }
    }
}

impl InitPolicy {
    /// Initializer for convolution and linear weights.
    ///
    /// Kaiming uses the fan-in gain for a rectifier and ignores `gain`,
    /// matching the usual CycleGAN setup.
    pub fn weight_initializer(self, gain: f64) -> Initializer {
        match self {
            InitPolicy::Normal => Initializer::Normal {
                mean: 0.0,
                std: gain,
            },
            InitPolicy::Xavier => Initializer::XavierNormal { gain },
            InitPolicy::Kaiming => Initializer::KaimingNormal {
                gain: SQRT_2,
                fan_out_only: false,
            },
            InitPolicy::Orthogonal => Initializer::Orthogonal { gain },
        }
    }
}

/// Initializers for normalization layer weight and bias.
pub fn norm_initializers(gain: f64) -> (Initializer, Initializer) {
    (
        Initializer::Normal {
            mean: 1.0,
            std: gain,
        },
        Initializer::Zeros,
    )
}

const PLATEAU_FACTOR: f64 = 0.2;
const PLATEAU_THRESHOLD: f64 = 0.01;
const PLATEAU_PATIENCE: usize = 5;

/// Learning-rate decay policy, chosen once at configuration time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LrPolicy {
    /// Constant until `start_decay`, then linear decay over `decay_cycle`
    /// epochs; `epoch_count` offsets the epoch counter when resuming.
    Linear {
        epoch_count: usize,
        start_decay: usize,
        decay_cycle: usize,
    },
    /// Scale by 0.1 every `decay_iters` epochs.
    Step { decay_iters: usize },
    /// Scale by 0.2 once the observed metric stops improving; driven by
    /// [`DecayLrScheduler::step_metric`].
    Plateau,
    /// Cosine annealing from the initial rate to zero over `t_max` epochs.
    Cosine { t_max: usize },
}

/// Epoch-driven learning-rate schedule for one optimizer.
#[derive(Debug, Clone)]
pub struct DecayLrScheduler {
    policy: LrPolicy,
    initial_lr: f64,
    lr: f64,
    epoch: usize,
    best_metric: f64,
    bad_epochs: usize,
}

#[derive(Record, Clone)]
pub struct DecayLrRecord {
    pub lr: f64,
    pub epoch: usize,
    pub best_metric: f64,
    pub bad_epochs: usize,
}

impl DecayLrScheduler {
    pub fn new(policy: LrPolicy, initial_lr: f64) -> Self {
        let mut scheduler = Self {
            policy,
            initial_lr,
            lr: initial_lr,
            epoch: 0,
            best_metric: f64::INFINITY,
            bad_epochs: 0,
        };
        scheduler.lr = scheduler.rate_at(0);
        scheduler
    }

    /// Current learning rate.
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Rate for a given epoch; pure for every policy except plateau, which
    /// keeps whatever rate its metric observations have produced.
    fn rate_at(&self, epoch: usize) -> f64 {
        match self.policy {
            LrPolicy::Linear {
                epoch_count,
                start_decay,
                decay_cycle,
            } => {
                let over = (epoch + epoch_count).saturating_sub(start_decay);
                self.initial_lr * (1.0 - over as f64 / (decay_cycle + 1) as f64)
            }
            LrPolicy::Step { decay_iters } => {
                self.initial_lr * 0.1f64.powi((epoch / decay_iters) as i32)
            }
            LrPolicy::Plateau => self.lr,
            LrPolicy::Cosine { t_max } => {
                self.initial_lr * 0.5 * (1.0 + (PI * epoch as f64 / t_max as f64).cos())
            }
        }
    }

    /// Advance the plateau policy with a validation metric (min mode).
    ///
    /// The rate is multiplied by 0.2 after more than `PLATEAU_PATIENCE`
    /// consecutive observations without a relative 1% improvement on the
    /// best metric seen so far.
    pub fn step_metric(&mut self, metric: f64) -> f64 {
        if metric < self.best_metric * (1.0 - PLATEAU_THRESHOLD) {
            self.best_metric = metric;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
            if self.bad_epochs > PLATEAU_PATIENCE {
                self.lr *= PLATEAU_FACTOR;
                self.bad_epochs = 0;
            }
        }
        self.lr
    }
}

impl LrScheduler for DecayLrScheduler {
    type Record<B: Backend> = DecayLrRecord;

    fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.lr = self.rate_at(self.epoch);
        self.lr
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        DecayLrRecord {
            lr: self.lr,
            epoch: self.epoch,
            best_metric: self.best_metric,
            bad_epochs: self.bad_epochs,
        }
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.lr = record.lr;
        self.epoch = record.epoch;
        self.best_metric = record.best_metric;
        self.bad_epochs = record.bad_epochs;
        self
    }
}

/// Learning-rate schedule settings.
#[derive(Config, Debug)]
pub struct SchedulerConfig {
    pub lr_policy: String,
    #[config(default = 2e-4)]
    pub learning_rate: f64,
    #[config(default = 0)]
    pub epoch_count: usize,
    #[config(default = 50)]
    pub start_decay: usize,
    #[config(default = 50)]
    pub decay_cycle: usize,
    #[config(default = 50)]
    pub lr_decay_iters: usize,
}

/// Build the schedule named by `lr_policy`; unknown names are a hard
/// configuration error.
pub fn get_scheduler(config: &SchedulerConfig) -> Result<DecayLrScheduler> {
    let policy = match config.lr_policy.as_str() {
        "linear" => LrPolicy::Linear {
            epoch_count: config.epoch_count,
            start_decay: config.start_decay,
            decay_cycle: config.decay_cycle,
        },
        "step" => {
            if config.lr_decay_iters == 0 {
                bail!("lr_decay_iters must be positive for the step policy");
            }
            LrPolicy::Step {
                decay_iters: config.lr_decay_iters,
            }
        }
        "plateau" => LrPolicy::Plateau,
        "cosine" => {
            if config.start_decay == 0 {
                bail!("start_decay must be positive for the cosine policy");
            }
            LrPolicy::Cosine {
                t_max: config.start_decay,
            }
        }
        other => bail!("learning rate policy [{other}] is not implemented"),
    };

    Ok(DecayLrScheduler::new(policy, config.learning_rate))
}
