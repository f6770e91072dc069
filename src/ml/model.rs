// ============================================================
// Layer 5: Spec2Pep Model
// ============================================================
// A spectrum-to-peptide transformer built on Burn, wrapped in
// the interface the runner drives: build from hyperparameters,
// strict weight loading, placement, freezing, and the three
// step functions.
//
// Architecture:
//
//   peaks (m/z, intensity)
//       │  sinusoidal m/z encoding ⊕ learned intensity projection
//       ▼
//   n_layers x EncoderBlock   (self-attention over peaks, padded
//       │                      peaks masked out)         = memory
//       ▼
//   decoder input, position 0:  mass encoding + charge embedding
//                  position t:  aa_embedding(residue t) + pos(t)
//       │
//   n_layers x DecoderBlock   (causal self-attention, then
//       │                      cross-attention to memory)
//       ▼
//   logits = Linear(d_model -> vocab) at every position
//
// Training runs on Autodiff<NdArray> with Adam, on label-smoothed
// cross entropy, under a linear warmup x cosine learning-rate
// schedule. Validation and prediction call `valid()` to get the
// same network on the plain NdArray backend with dropout off.
//
// Decoding is greedy. `n_beams` and `top_match` are carried but a
// single candidate is produced per spectrum.
//
// A model loaded with Placement::Placeholder knows its shapes but
// holds no network; any computation fails with DevicePlaceholder.
//
// Reference: Burn Book §3 (Building Blocks), Vaswani et al. (2017)

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;

use burn::{
    backend::{Autodiff, NdArray},
    module::AutodiffModule,
    nn::{
        attention::{generate_autoregressive_mask, MhaInput, MultiHeadAttention, MultiHeadAttentionConfig},
        Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear,
        LinearConfig,
    },
    optim::{decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
    tensor::activation::{gelu, log_softmax, softmax},
};
use serde::{Deserialize, Serialize};

use crate::data::batcher::SpectrumBatch;
use crate::data::tokenizer::{PeptideTokenizer, STOP_ID};
use crate::domain::error::{self, RunnerError};
use crate::domain::psm::Psm;
use crate::domain::spectrum::{SpectrumRecord, PROTON_MASS};
use crate::infra::checkpoint::Checkpoint;
use crate::infra::metrics::ValidationMetrics;
use crate::ml::hparams::{ArchitectureParams, BehaviorParams, Hyperparameters};

pub type TrainBackend = Autodiff<NdArray>;
pub type InferBackend = NdArray;

type TrainNet = Spec2PepNet<TrainBackend>;
type WeightRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// Mass difference between 13C and 12C.
const C13_MASS_DIFF: f64 = 1.003_355;

/// Wavelength range of the m/z encoding, in m/z units.
const MZ_WAVELENGTHS: (f64, f64) = (0.001, 10_000.0);

/// Wavelength range of the precursor mass encoding, in Da.
const MASS_WAVELENGTHS: (f64, f64) = (0.001, 10_000.0);

/// Wavelength range of the decoder position encoding.
const POS_WAVELENGTHS: (f64, f64) = (1.0, 10_000.0);

/// Where weight values live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    #[default]
    Cpu,
    /// Shapes only; used to inspect a checkpoint without loading values.
    Placeholder,
}

fn device() -> <InferBackend as Backend>::Device {
    Default::default()
}

// ─── Weight layout ────────────────────────────────────────────────────────────

fn attention_shapes(shapes: &mut BTreeMap<String, Vec<usize>>, prefix: &str, d: usize) {
    for proj in ["query", "key", "value", "output"] {
        shapes.insert(format!("{prefix}.{proj}.weight"), vec![d, d]);
        shapes.insert(format!("{prefix}.{proj}.bias"), vec![d]);
    }
}

fn block_shapes(shapes: &mut BTreeMap<String, Vec<usize>>, prefix: &str, d: usize, ff: usize, n_norms: usize) {
    shapes.insert(format!("{prefix}.ffn_linear1.weight"), vec![d, ff]);
    shapes.insert(format!("{prefix}.ffn_linear1.bias"), vec![ff]);
    shapes.insert(format!("{prefix}.ffn_linear2.weight"), vec![ff, d]);
    shapes.insert(format!("{prefix}.ffn_linear2.bias"), vec![d]);
    for n in 1..=n_norms {
        shapes.insert(format!("{prefix}.norm{n}.gamma"), vec![d]);
        shapes.insert(format!("{prefix}.norm{n}.beta"), vec![d]);
    }
}

/// Every tensor the architecture needs, with its shape. Linear weights
/// are stored `[d_input, d_output]`.
pub fn expected_shapes(arch: &ArchitectureParams, vocab_size: usize) -> BTreeMap<String, Vec<usize>> {
    let d = arch.dim_model;
    let ff = arch.dim_feedforward;
    let mut shapes = BTreeMap::new();
    shapes.insert(
        "encoder.intensity_encoder.weight".to_string(),
        vec![1, arch.dim_intensity.unwrap_or(d)],
    );
    for i in 0..arch.n_layers {
        let prefix = format!("encoder.layers.{i}");
        attention_shapes(&mut shapes, &format!("{prefix}.self_attn"), d);
        block_shapes(&mut shapes, &prefix, d, ff, 2);
    }
    shapes.insert(
        "decoder.charge_encoder.weight".to_string(),
        vec![usize::from(arch.max_charge), d],
    );
    shapes.insert("decoder.aa_encoder.weight".to_string(), vec![vocab_size, d]);
    for i in 0..arch.n_layers {
        let prefix = format!("decoder.layers.{i}");
        attention_shapes(&mut shapes, &format!("{prefix}.self_attn"), d);
        attention_shapes(&mut shapes, &format!("{prefix}.cross_attn"), d);
        block_shapes(&mut shapes, &prefix, d, ff, 3);
    }
    shapes.insert("decoder.final.weight".to_string(), vec![d, vocab_size]);
    shapes.insert("decoder.final.bias".to_string(), vec![vocab_size]);
    shapes
}

// ─── Network ──────────────────────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct Spec2PepConfig {
    pub dim_model: usize,
    pub n_head: usize,
    pub dim_feedforward: usize,
    pub n_layers: usize,
    pub dropout: f64,
    pub dim_intensity: Option<usize>,
    pub vocab_size: usize,
    pub max_charge: usize,
}

impl Spec2PepConfig {
    pub fn from_arch(arch: &ArchitectureParams, vocab_size: usize) -> Self {
        Self {
            dim_model: arch.dim_model,
            n_head: arch.n_head,
            dim_feedforward: arch.dim_feedforward,
            n_layers: arch.n_layers,
            dropout: arch.dropout,
            dim_intensity: arch.dim_intensity,
            vocab_size,
            max_charge: usize::from(arch.max_charge),
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Spec2PepNet<B> {
        let d = self.dim_model;
        let intensity_dim = self.dim_intensity.unwrap_or(d);
        let intensity_encoder = LinearConfig::new(1, intensity_dim).with_bias(false).init(device);
        let encoder_layers = (0..self.n_layers).map(|_| self.encoder_block(device)).collect();
        let charge_encoder = EmbeddingConfig::new(self.max_charge, d).init(device);
        let aa_encoder = EmbeddingConfig::new(self.vocab_size, d).init(device);
        let decoder_layers = (0..self.n_layers).map(|_| self.decoder_block(device)).collect();
        let head = LinearConfig::new(d, self.vocab_size).init(device);
        Spec2PepNet {
            intensity_encoder,
            encoder_layers,
            charge_encoder,
            aa_encoder,
            decoder_layers,
            head,
            dim_model: d,
            mz_dim: d - self.dim_intensity.unwrap_or(0),
            max_charge: self.max_charge,
        }
    }

    fn attention<B: Backend>(&self, device: &B::Device) -> MultiHeadAttention<B> {
        MultiHeadAttentionConfig::new(self.dim_model, self.n_head)
            .with_dropout(self.dropout)
            .init(device)
    }

    fn encoder_block<B: Backend>(&self, device: &B::Device) -> EncoderBlock<B> {
        EncoderBlock {
            self_attn: self.attention(device),
            ffn_linear1: LinearConfig::new(self.dim_model, self.dim_feedforward).init(device),
            ffn_linear2: LinearConfig::new(self.dim_feedforward, self.dim_model).init(device),
            norm1: LayerNormConfig::new(self.dim_model).init(device),
            norm2: LayerNormConfig::new(self.dim_model).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }

    fn decoder_block<B: Backend>(&self, device: &B::Device) -> DecoderBlock<B> {
        DecoderBlock {
            self_attn: self.attention(device),
            cross_attn: self.attention(device),
            ffn_linear1: LinearConfig::new(self.dim_model, self.dim_feedforward).init(device),
            ffn_linear2: LinearConfig::new(self.dim_feedforward, self.dim_model).init(device),
            norm1: LayerNormConfig::new(self.dim_model).init(device),
            norm2: LayerNormConfig::new(self.dim_model).init(device),
            norm3: LayerNormConfig::new(self.dim_model).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    pub self_attn: MultiHeadAttention<B>,
    pub ffn_linear1: Linear<B>,
    pub ffn_linear2: Linear<B>,
    pub norm1: LayerNorm<B>,
    pub norm2: LayerNorm<B>,
    pub dropout: Dropout,
}

impl<B: Backend> EncoderBlock<B> {
    /// `mask_pad` is true for padded peaks.
    pub fn forward(&self, x: Tensor<B, 3>, mask_pad: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        let attn = self
            .self_attn
            .forward(MhaInput::self_attn(x.clone()).mask_pad(mask_pad))
            .context;
        let x = self.norm1.forward(x + self.dropout.forward(attn));
        let ffn = self.ffn_linear2.forward(gelu(self.ffn_linear1.forward(x.clone())));
        self.norm2.forward(x + self.dropout.forward(ffn))
    }
}

#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    pub self_attn: MultiHeadAttention<B>,
    pub cross_attn: MultiHeadAttention<B>,
    pub ffn_linear1: Linear<B>,
    pub ffn_linear2: Linear<B>,
    pub norm1: LayerNorm<B>,
    pub norm2: LayerNorm<B>,
    pub norm3: LayerNorm<B>,
    pub dropout: Dropout,
}

impl<B: Backend> DecoderBlock<B> {
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        memory: Tensor<B, 3>,
        causal: Tensor<B, 3, Bool>,
        memory_pad: Tensor<B, 2, Bool>,
    ) -> Tensor<B, 3> {
        let attn = self
            .self_attn
            .forward(MhaInput::self_attn(x.clone()).mask_attn(causal))
            .context;
        let x = self.norm1.forward(x + self.dropout.forward(attn));
        let cross = self
            .cross_attn
            .forward(MhaInput::new(x.clone(), memory.clone(), memory).mask_pad(memory_pad))
            .context;
        let x = self.norm2.forward(x + self.dropout.forward(cross));
        let ffn = self.ffn_linear2.forward(gelu(self.ffn_linear1.forward(x.clone())));
        self.norm3.forward(x + self.dropout.forward(ffn))
    }
}

#[derive(Module, Debug)]
pub struct Spec2PepNet<B: Backend> {
    pub intensity_encoder: Linear<B>,
    pub encoder_layers: Vec<EncoderBlock<B>>,
    pub charge_encoder: Embedding<B>,
    pub aa_encoder: Embedding<B>,
    pub decoder_layers: Vec<DecoderBlock<B>>,
    pub head: Linear<B>,
    pub dim_model: usize,
    pub mz_dim: usize,
    pub max_charge: usize,
}

impl<B: Backend> Spec2PepNet<B> {
    /// Encode a batch of spectra: memory `[batch, peaks, d_model]` and the
    /// padding mask `[batch, peaks]`.
    pub fn encode(&self, spectra: &[SpectrumRecord], device: &B::Device) -> (Tensor<B, 3>, Tensor<B, 2, Bool>) {
        let b = spectra.len();
        // An empty spectrum still gets one (zero) slot so attention has a key.
        let p = spectra.iter().map(SpectrumRecord::n_peaks).max().unwrap_or(0).max(1);
        let w = self.mz_dim;

        let mut mz = vec![0.0f32; b * p * w];
        let mut intensity = vec![0.0f32; b * p];
        let mut pad = vec![1i64; b * p];
        for (i, rec) in spectra.iter().enumerate() {
            pad[i * p] = 0;
            for (j, (&m, &inten)) in rec.mz.iter().zip(&rec.intensity).enumerate() {
                let at = i * p + j;
                sinusoid(m, MZ_WAVELENGTHS, &mut mz[at * w..(at + 1) * w]);
                intensity[at] = inten;
                pad[at] = 0;
            }
        }

        let mz = Tensor::<B, 3>::from_data(TensorData::new(mz, [b, p, w]), device);
        let intensity = Tensor::<B, 3>::from_data(TensorData::new(intensity, [b, p, 1]), device);
        let intensity = self.intensity_encoder.forward(intensity);
        let mut x = if w < self.dim_model {
            Tensor::cat(vec![mz, intensity], 2)
        } else {
            mz + intensity
        };

        let mask = Tensor::<B, 2, Int>::from_data(TensorData::new(pad, [b, p]), device).equal_elem(1);
        for layer in &self.encoder_layers {
            x = layer.forward(x, mask.clone());
        }
        (x, mask)
    }

    /// Logits `[batch, 1 + longest prefix, vocab]`. Position 0 carries the
    /// precursor; shorter prefixes are padded with the stop token.
    pub fn decode(
        &self,
        memory: Tensor<B, 3>,
        memory_pad: Tensor<B, 2, Bool>,
        spectra: &[SpectrumRecord],
        prefixes: &[Vec<usize>],
    ) -> Tensor<B, 3> {
        let device = memory.device();
        let b = spectra.len();
        let d = self.dim_model;
        let t = prefixes.iter().map(Vec::len).max().unwrap_or(0);
        let seq = t + 1;

        // ── Token embeddings ──
        let charges: Vec<i64> = spectra
            .iter()
            .map(|rec| (usize::from(rec.precursor_charge).clamp(1, self.max_charge) - 1) as i64)
            .collect();
        let mut x = self
            .charge_encoder
            .forward(Tensor::<B, 2, Int>::from_data(TensorData::new(charges, [b, 1]), &device));
        if t > 0 {
            let ids: Vec<i64> = prefixes
                .iter()
                .flat_map(|p| (0..t).map(move |k| p.get(k).copied().unwrap_or(STOP_ID) as i64))
                .collect();
            let aa = self
                .aa_encoder
                .forward(Tensor::<B, 2, Int>::from_data(TensorData::new(ids, [b, t]), &device));
            x = Tensor::cat(vec![x, aa], 1);
        }

        // ── Position and precursor mass encodings ──
        let mut positions = vec![0.0f32; seq * d];
        for pos in 0..seq {
            sinusoid(pos as f64, POS_WAVELENGTHS, &mut positions[pos * d..(pos + 1) * d]);
        }
        let mut extra = Vec::with_capacity(b * seq * d);
        let mut mass = vec![0.0f32; d];
        for rec in spectra {
            sinusoid(rec.precursor_mass(), MASS_WAVELENGTHS, &mut mass);
            extra.extend(positions[..d].iter().zip(&mass).map(|(p, m)| p + m));
            extra.extend_from_slice(&positions[d..]);
        }
        let mut x = x + Tensor::<B, 3>::from_data(TensorData::new(extra, [b, seq, d]), &device);

        let causal = generate_autoregressive_mask::<B>(b, seq, &device);
        for layer in &self.decoder_layers {
            x = layer.forward(x, memory.clone(), causal.clone(), memory_pad.clone());
        }
        self.head.forward(x)
    }

    /// Teacher-forced logits for a batch.
    pub fn forward(&self, spectra: &[SpectrumRecord], prefixes: &[Vec<usize>], device: &B::Device) -> Tensor<B, 3> {
        let (memory, mask) = self.encode(spectra, device);
        self.decode(memory, mask, spectra, prefixes)
    }
}

/// Mean label-smoothed cross entropy over the target tokens; positions
/// past a target's end are ignored.
fn smoothed_cross_entropy<B: Backend>(logits: Tensor<B, 3>, targets: &[Vec<usize>], smoothing: f64) -> Tensor<B, 1> {
    let [b, seq, v] = logits.dims();
    let uniform = (smoothing / v as f64) as f32;
    let mut y = vec![0.0f32; b * seq * v];
    let mut n_tokens = 0usize;
    for (i, target) in targets.iter().enumerate() {
        for (pos, &id) in target.iter().enumerate().take(seq) {
            let row = &mut y[(i * seq + pos) * v..(i * seq + pos + 1) * v];
            row.fill(uniform);
            row[id] += (1.0 - smoothing) as f32;
            n_tokens += 1;
        }
    }
    let y = Tensor::<B, 3>::from_data(TensorData::new(y, [b, seq, v]), &logits.device());
    (y * log_softmax(logits, 2))
        .sum()
        .neg()
        .div_scalar(n_tokens.max(1) as f32)
}

// ─── Optimizer ────────────────────────────────────────────────────────────────

/// Object-safe handle on a Burn optimizer over the training network.
trait NetOptimizer: Send {
    fn step(&mut self, lr: f64, net: TrainNet, grads: GradientsParams) -> TrainNet;
}

impl<O: Optimizer<TrainNet, TrainBackend>> NetOptimizer for O {
    fn step(&mut self, lr: f64, net: TrainNet, grads: GradientsParams) -> TrainNet {
        Optimizer::step(self, lr, net, grads)
    }
}

/// Adam with the configured L2 penalty.
fn adam(behavior: &BehaviorParams) -> Box<dyn NetOptimizer> {
    let decay = (behavior.weight_decay > 0.0).then(|| WeightDecayConfig::new(behavior.weight_decay as f32));
    Box::new(
        AdamConfig::new()
            .with_epsilon(1e-8)
            .with_weight_decay(decay)
            .init::<TrainBackend, TrainNet>(),
    )
}

// ─── Step outputs ─────────────────────────────────────────────────────────────

/// Result of one validation batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutput {
    /// Mean label-smoothed cross entropy per target token.
    pub loss: f64,
    /// (ground truth, greedy prediction) per spectrum, when precision is enabled.
    pub pairs: Option<Vec<(String, String)>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Decoded {
    ids: Vec<usize>,
    aa_scores: Vec<f32>,
}

// ─── Spec2Pep ─────────────────────────────────────────────────────────────────

pub struct Spec2Pep {
    hparams: Hyperparameters,
    tokenizer: PeptideTokenizer,
    /// `None` for placeholder models.
    net: Option<TrainNet>,
    optim: Option<Box<dyn NetOptimizer>>,
    placement: Placement,
    frozen: bool,
    history: Vec<ValidationMetrics>,
}

impl fmt::Debug for Spec2Pep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spec2Pep")
            .field("hparams", &self.hparams)
            .field("placement", &self.placement)
            .field("frozen", &self.frozen)
            .field("num_params", &self.num_params())
            .finish_non_exhaustive()
    }
}

impl Spec2Pep {
    /// Fresh model with Burn's default initializers, seeded by `seed`.
    pub fn new(hparams: Hyperparameters, seed: u64) -> error::Result<Self> {
        hparams.architecture.validate()?;
        let tokenizer = PeptideTokenizer::new(&hparams.architecture.residues)?;
        TrainBackend::seed(seed);
        let net = Spec2PepConfig::from_arch(&hparams.architecture, tokenizer.vocab_size())
            .init::<TrainBackend>(&device());

        tracing::debug!(
            "Initialized Spec2Pep: {} layers, dim_model={}, {} parameters",
            hparams.architecture.n_layers,
            hparams.architecture.dim_model,
            net.num_params()
        );

        Ok(Self {
            hparams,
            tokenizer,
            net: Some(net),
            optim: None,
            placement: Placement::Cpu,
            frozen: false,
            history: Vec::new(),
        })
    }

    /// Rebuild from a checkpoint. Every tensor must exist with exactly the
    /// shape `hparams` implies, and no extra tensor is allowed.
    pub fn from_checkpoint(ckpt: Checkpoint, hparams: Hyperparameters, placement: Placement) -> error::Result<Self> {
        hparams.architecture.validate()?;
        let tokenizer = PeptideTokenizer::new(&hparams.architecture.residues)?;
        let expected = expected_shapes(&hparams.architecture, tokenizer.vocab_size());

        for (name, shape) in &expected {
            match ckpt.shapes.get(name) {
                Some(found) if found == shape => {}
                found => {
                    return Err(RunnerError::ShapeMismatch {
                        name: name.clone(),
                        expected: shape.clone(),
                        found: found.cloned().unwrap_or_default(),
                    })
                }
            }
        }
        if let Some((name, shape)) = ckpt.shapes.iter().find(|(n, _)| !expected.contains_key(*n)) {
            return Err(RunnerError::ShapeMismatch {
                name: name.clone(),
                expected: Vec::new(),
                found: shape.clone(),
            });
        }

        let net = match (placement, ckpt.record) {
            (Placement::Cpu, Some(bytes)) => {
                let device = device();
                let record: Spec2PepNetRecord<TrainBackend> = WeightRecorder::new()
                    .load(bytes, &device)
                    .map_err(|e| RunnerError::corrupt("model record", format!("{e:?}")))?;
                let net = Spec2PepConfig::from_arch(&hparams.architecture, tokenizer.vocab_size())
                    .init::<TrainBackend>(&device);
                Some(net.load_record(record))
            }
            _ => None,
        };

        Ok(Self {
            hparams,
            tokenizer,
            placement: if net.is_some() { Placement::Cpu } else { Placement::Placeholder },
            net,
            optim: None,
            frozen: false,
            history: Vec::new(),
        })
    }

    pub fn to_checkpoint(&self, epoch: usize, global_step: usize) -> error::Result<Checkpoint> {
        let net = self.net()?;
        let record = WeightRecorder::new()
            .record(net.clone().into_record(), ())
            .map_err(|e| RunnerError::Config(format!("cannot serialize model weights: {e:?}")))?;
        Ok(Checkpoint::new(
            epoch,
            global_step,
            Some(self.hparams.to_map()?),
            self.shapes(),
            Some(record),
        ))
    }

    pub fn hparams(&self) -> &Hyperparameters {
        &self.hparams
    }

    pub fn tokenizer(&self) -> &PeptideTokenizer {
        &self.tokenizer
    }

    /// Named tensor shapes of this architecture.
    pub fn shapes(&self) -> BTreeMap<String, Vec<usize>> {
        expected_shapes(&self.hparams.architecture, self.tokenizer.vocab_size())
    }

    /// Trainable scalars, 0 for a placeholder model.
    pub fn num_params(&self) -> usize {
        self.net.as_ref().map_or(0, |net| net.num_params())
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn n_layers(&self) -> usize {
        self.hparams.architecture.n_layers
    }

    /// Disable weight updates for inference.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Validation history, one row per validation pass.
    pub fn history(&self) -> &[ValidationMetrics] {
        &self.history
    }

    pub fn record_validation(&mut self, row: ValidationMetrics) {
        self.history.push(row);
    }

    /// Learning rate at `step`: linear warmup times a cosine period.
    pub fn learning_rate(&self, step: usize) -> f64 {
        let b = &self.hparams.behavior;
        let period = b.cosine_schedule_period_iters.max(1) as f64;
        let mut factor = 0.5 * (1.0 + (PI * step as f64 / period).cos());
        if step <= b.warmup_iters && b.warmup_iters > 0 {
            factor *= step as f64 / b.warmup_iters as f64;
        }
        b.lr * factor
    }

    // ── Steps ────────────────────────────────────────────────────────────────

    /// One Adam update on an annotated batch; returns the mean token loss.
    pub fn training_step(&mut self, batch: &SpectrumBatch, step: usize) -> error::Result<f64> {
        if self.frozen {
            return Err(RunnerError::Config("cannot train a frozen model".into()));
        }
        let targets = self.batch_targets(batch)?;
        if targets.is_empty() {
            return Ok(0.0);
        }
        let net = self.net()?;
        let logits = net.forward(&batch.spectra, &teacher_inputs(&targets), &device());
        let loss = smoothed_cross_entropy(logits, &targets, self.hparams.behavior.train_label_smoothing);
        let value = loss.clone().into_scalar().elem::<f64>();
        let grads = GradientsParams::from_grads(loss.backward(), net);

        let lr = self.learning_rate(step);
        let optim = self.optim.get_or_insert_with(|| adam(&self.hparams.behavior));
        if let Some(net) = self.net.take() {
            self.net = Some(optim.step(lr, net, grads));
        }
        Ok(value)
    }

    /// Loss on an annotated batch, plus greedy predictions when
    /// `calculate_precision` is set.
    pub fn validation_step(&self, batch: &SpectrumBatch) -> error::Result<ValidationOutput> {
        let targets = self.batch_targets(batch)?;
        let net = self.net()?.valid();
        if targets.is_empty() {
            return Ok(ValidationOutput {
                loss: 0.0,
                pairs: self.hparams.behavior.calculate_precision.then(Vec::new),
            });
        }

        let logits = net.forward(&batch.spectra, &teacher_inputs(&targets), &device());
        let loss = smoothed_cross_entropy(logits, &targets, self.hparams.behavior.train_label_smoothing)
            .into_scalar()
            .elem::<f64>();

        let pairs = if self.hparams.behavior.calculate_precision {
            let decoded = self.greedy(&net, &batch.spectra)?;
            Some(
                batch
                    .spectra
                    .iter()
                    .zip(decoded)
                    .map(|(rec, d)| {
                        (
                            rec.annotation.clone().unwrap_or_default(),
                            self.tokenizer.detokenize(&d.ids),
                        )
                    })
                    .collect(),
            )
        } else {
            None
        };
        Ok(ValidationOutput { loss, pairs })
    }

    /// Greedy prediction for every spectrum of the batch.
    pub fn predict_step(&self, batch: &SpectrumBatch) -> error::Result<Vec<Psm>> {
        let net = self.net()?.valid();
        let decoded = self.greedy(&net, &batch.spectra)?;
        Ok(batch
            .spectra
            .iter()
            .zip(decoded)
            .filter(|(_, d)| !d.ids.is_empty())
            .map(|(rec, d)| self.to_psm(rec, d))
            .collect())
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn net(&self) -> error::Result<&TrainNet> {
        self.net.as_ref().ok_or_else(|| {
            RunnerError::DevicePlaceholder("encoder.intensity_encoder.weight".to_string())
        })
    }

    fn batch_targets(&self, batch: &SpectrumBatch) -> error::Result<Vec<Vec<usize>>> {
        batch.spectra.iter().map(|rec| self.targets(rec)).collect()
    }

    /// Residue ids of the annotation, truncated to max_length, then stop.
    fn targets(&self, rec: &SpectrumRecord) -> error::Result<Vec<usize>> {
        let peptide = rec.annotation.as_deref().ok_or_else(|| {
            RunnerError::AnnotationIndex(format!(
                "spectrum {} has no annotation to train on",
                rec.spectrum_key()
            ))
        })?;
        let mut ids = self.tokenizer.tokenize(peptide)?;
        ids.truncate(self.hparams.behavior.max_length);
        ids.push(STOP_ID);
        Ok(ids)
    }

    fn greedy(&self, net: &Spec2PepNet<InferBackend>, spectra: &[SpectrumRecord]) -> error::Result<Vec<Decoded>> {
        let b = &self.hparams.behavior;
        let v = self.tokenizer.vocab_size();
        let mut decoded = vec![Decoded::default(); spectra.len()];
        if spectra.is_empty() {
            return Ok(decoded);
        }

        let (memory, mask) = net.encode(spectra, &device());
        let mut done = vec![false; spectra.len()];
        for _ in 0..b.max_length {
            let prefixes: Vec<Vec<usize>> = decoded.iter().map(|d| d.ids.clone()).collect();
            let logits = net.decode(memory.clone(), mask.clone(), spectra, &prefixes);
            let [n, seq, _] = logits.dims();
            let probs: Vec<f32> = softmax(logits.slice([0..n, seq - 1..seq, 0..v]), 2)
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| RunnerError::Config(format!("cannot read model output: {e:?}")))?;

            for (i, d) in decoded.iter_mut().enumerate() {
                if done[i] {
                    continue;
                }
                let row = &probs[i * v..(i + 1) * v];
                let may_stop = d.ids.len() >= b.min_peptide_len;
                let best = (0..v)
                    .filter(|&k| may_stop || k != STOP_ID)
                    .max_by(|&x, &y| row[x].total_cmp(&row[y]))
                    .unwrap_or(STOP_ID);
                if best == STOP_ID {
                    done[i] = true;
                } else {
                    d.ids.push(best);
                    d.aa_scores.push(row[best]);
                }
            }
            if done.iter().all(|&x| x) {
                break;
            }
        }
        Ok(decoded)
    }

    fn to_psm(&self, rec: &SpectrumRecord, decoded: Decoded) -> Psm {
        let b = &self.hparams.behavior;
        let z = f64::from(rec.precursor_charge.max(1));
        let calc_mz = (self.tokenizer.mass_of_ids(&decoded.ids) + z * PROTON_MASS) / z;
        let exp_mz = rec.precursor_mz;

        let (lo, hi) = b.isotope_error_range;
        let matched = (lo..=hi).any(|iso| {
            let observed = exp_mz - f64::from(iso) * C13_MASS_DIFF / z;
            ((calc_mz - observed) / observed * 1e6).abs() < b.precursor_mass_tol
        });

        let mean = decoded.aa_scores.iter().sum::<f32>() / decoded.aa_scores.len().max(1) as f32;
        let score = if matched { mean } else { mean - 1.0 };

        Psm {
            sequence: self.tokenizer.detokenize(&decoded.ids),
            file_index: rec.file_index,
            scan_id: rec
                .scan_id
                .clone()
                .unwrap_or_else(|| format!("index={}", rec.index)),
            spectrum_key: rec.spectrum_key(),
            score,
            aa_scores: decoded.aa_scores,
            charge: rec.precursor_charge,
            exp_mz,
            calc_mz,
            retention_time: rec.retention_time,
        }
    }
}

/// Decoder inputs for teacher forcing: each target without its stop token.
fn teacher_inputs(targets: &[Vec<usize>]) -> Vec<Vec<usize>> {
    targets
        .iter()
        .map(|t| t[..t.len().saturating_sub(1)].to_vec())
        .collect()
}

/// Sine/cosine pairs over a geometric range of wavelengths.
fn sinusoid(value: f64, (min_wl, max_wl): (f64, f64), out: &mut [f32]) {
    let n = out.len() / 2;
    let denom = n.saturating_sub(1).max(1) as f64;
    for i in 0..n {
        let wl = min_wl * (max_wl / min_wl).powf(i as f64 / denom);
        let angle = 2.0 * PI * value / wl;
        out[2 * i] = angle.sin() as f32;
        out[2 * i + 1] = angle.cos() as f32;
    }
    if out.len() % 2 == 1 {
        out[out.len() - 1] = 0.0;
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    fn spectrum(annotation: Option<&str>) -> SpectrumRecord {
        let mut rec = SpectrumRecord::new(
            vec![175.119, 288.203, 401.287, 514.371],
            vec![0.5, 0.5, 0.5, 0.5],
            416.2,
            2,
        );
        rec.annotation = annotation.map(str::to_string);
        rec.scan_id = Some("scan=1".into());
        rec
    }

    fn batch(annotation: Option<&str>) -> SpectrumBatch {
        SpectrumBatch {
            spectra: vec![spectrum(annotation)],
        }
    }

    fn record_bytes(model: &Spec2Pep) -> Vec<u8> {
        model.to_checkpoint(0, 0).unwrap().record.unwrap()
    }

    #[test]
    fn test_layout_matches_network_tensors() {
        let model = Spec2Pep::new(test_support::tiny_hparams(), 1).unwrap();
        let shapes = model.shapes();
        let net = model.net().unwrap();
        assert_eq!(
            shapes["encoder.intensity_encoder.weight"],
            net.intensity_encoder.weight.val().dims().to_vec()
        );
        assert_eq!(
            shapes["encoder.layers.0.ffn_linear1.weight"],
            net.encoder_layers[0].ffn_linear1.weight.val().dims().to_vec()
        );
        assert_eq!(
            shapes["decoder.charge_encoder.weight"],
            net.charge_encoder.weight.val().dims().to_vec()
        );
        assert_eq!(
            shapes["decoder.aa_encoder.weight"],
            net.aa_encoder.weight.val().dims().to_vec()
        );
        assert_eq!(shapes["decoder.final.weight"], net.head.weight.val().dims().to_vec());
        assert_eq!(net.encoder_layers.len(), 1);
        assert_eq!(net.decoder_layers.len(), 1);
    }

    #[test]
    fn test_dim_intensity_splits_peak_encoding() {
        let mut hp = test_support::tiny_hparams();
        hp.architecture.dim_intensity = Some(4);
        let model = Spec2Pep::new(hp, 1).unwrap();
        let net = model.net().unwrap();
        assert_eq!(net.mz_dim, 12);
        let (memory, mask) = net.encode(&batch(None).spectra, &device());
        assert_eq!(memory.dims(), [1, 4, 16]);
        assert_eq!(mask.dims(), [1, 4]);
    }

    #[test]
    fn test_checkpoint_round_trip_is_strict() {
        let hp = test_support::tiny_hparams();
        let model = Spec2Pep::new(hp.clone(), 1).unwrap();
        let ckpt = model.to_checkpoint(0, 1).unwrap();
        let back = Spec2Pep::from_checkpoint(ckpt.clone(), hp.clone(), Placement::Cpu).unwrap();
        assert_eq!(record_bytes(&back), record_bytes(&model));
        assert_eq!(back.num_params(), model.num_params());

        let mut deeper = hp;
        deeper.architecture.n_layers += 1;
        let err = Spec2Pep::from_checkpoint(ckpt, deeper, Placement::Cpu).unwrap_err();
        assert_eq!(err.code(), "shape-mismatch");
    }

    #[test]
    fn test_unknown_tensor_is_a_mismatch() {
        let hp = test_support::tiny_hparams();
        let mut ckpt = Spec2Pep::new(hp.clone(), 1).unwrap().to_checkpoint(0, 0).unwrap();
        ckpt.shapes.insert("decoder.latent_spectrum".into(), vec![1, 16]);
        let err = Spec2Pep::from_checkpoint(ckpt, hp, Placement::Cpu).unwrap_err();
        assert_eq!(err.code(), "shape-mismatch");
        assert!(err.to_string().contains("latent_spectrum"));
    }

    #[test]
    fn test_garbled_record_is_corrupt() {
        let hp = test_support::tiny_hparams();
        let mut ckpt = Spec2Pep::new(hp.clone(), 1).unwrap().to_checkpoint(0, 0).unwrap();
        ckpt.record = Some(vec![0xc1, 0x00, 0xff]);
        let err = Spec2Pep::from_checkpoint(ckpt, hp, Placement::Cpu).unwrap_err();
        assert_eq!(err.code(), "corrupt-data");
    }

    #[test]
    fn test_training_reduces_loss_on_one_spectrum() {
        let mut hp = test_support::tiny_hparams();
        hp.behavior.lr = 0.01;
        hp.behavior.warmup_iters = 0;
        let mut model = Spec2Pep::new(hp, 3).unwrap();
        let b = batch(Some("PEPK"));
        let first = model.validation_step(&b).unwrap().loss;
        for step in 1..60 {
            model.training_step(&b, step).unwrap();
        }
        let last = model.validation_step(&b).unwrap().loss;
        assert!(last < first, "loss went from {first} to {last}");
    }

    #[test]
    fn test_frozen_model_rejects_training() {
        let mut model = Spec2Pep::new(test_support::tiny_hparams(), 1).unwrap();
        model.freeze();
        assert!(model.training_step(&batch(Some("PEPK")), 0).is_err());
    }

    #[test]
    fn test_training_needs_annotations() {
        let mut model = Spec2Pep::new(test_support::tiny_hparams(), 1).unwrap();
        let err = model.training_step(&batch(None), 0).unwrap_err();
        assert_eq!(err.code(), "annotation-index");
    }

    #[test]
    fn test_predict_respects_length_bounds() {
        let mut hp = test_support::tiny_hparams();
        hp.behavior.min_peptide_len = 3;
        hp.behavior.max_length = 8;
        let model = Spec2Pep::new(hp, 5).unwrap();
        let psms = model.predict_step(&batch(None)).unwrap();
        assert_eq!(psms.len(), 1);
        let n = psms[0].aa_scores.len();
        assert!((3..=8).contains(&n));
        assert_eq!(psms[0].scan_id, "scan=1");
        assert!(psms[0].aa_scores.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_empty_spectrum_still_decodes() {
        let model = Spec2Pep::new(test_support::tiny_hparams(), 2).unwrap();
        let mut rec = spectrum(None);
        rec.mz.clear();
        rec.intensity.clear();
        let psms = model
            .predict_step(&SpectrumBatch { spectra: vec![rec, spectrum(None)] })
            .unwrap();
        assert_eq!(psms.len(), 2);
    }

    #[test]
    fn test_placeholder_weights_cannot_compute() {
        let hp = test_support::tiny_hparams();
        let model = Spec2Pep::new(hp.clone(), 1).unwrap();
        let mut ckpt = model.to_checkpoint(0, 0).unwrap();
        ckpt.record = None;
        let ghost = Spec2Pep::from_checkpoint(ckpt, hp, Placement::Placeholder).unwrap();
        assert_eq!(ghost.placement(), Placement::Placeholder);
        assert_eq!(ghost.num_params(), 0);
        let err = ghost.predict_step(&batch(None)).unwrap_err();
        assert_eq!(err.code(), "device-placeholder");
        assert_eq!(ghost.to_checkpoint(0, 0).unwrap_err().code(), "device-placeholder");
    }

    #[test]
    fn test_schedule_warms_up_then_decays() {
        let mut hp = test_support::tiny_hparams();
        hp.behavior.lr = 1.0;
        hp.behavior.warmup_iters = 10;
        hp.behavior.cosine_schedule_period_iters = 100;
        let model = Spec2Pep::new(hp, 1).unwrap();
        assert_eq!(model.learning_rate(0), 0.0);
        assert!(model.learning_rate(5) < model.learning_rate(10));
        assert!(model.learning_rate(50) < model.learning_rate(10));
    }

    #[test]
    fn test_label_smoothing_ignores_padding() {
        let device = device();
        let logits = Tensor::<InferBackend, 3>::zeros([2, 3, 4], &device);
        // Uniform logits: every real token costs ln(4), padding costs nothing.
        let loss = smoothed_cross_entropy(logits, &[vec![1, 0], vec![2, 3, 0]], 0.1)
            .into_scalar()
            .elem::<f64>();
        assert!((loss - 4f64.ln()).abs() < 1e-5, "loss = {loss}");
    }
}
