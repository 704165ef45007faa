//! Synthetic end-to-end run: random frozen model, configured adapters,
//! dispatched batches and auxiliary router losses.

use std::collections::BTreeMap;

use anyhow::Context;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Activation, Embedding};
use mlora_core::moe::aux_loss::{load_balancing_loss, router_z_loss};
use mlora_core::routing::adapter_router_logits;
use mlora_core::{
    AdapterKind, BatchDescriptor, Dispatcher, FrozenFeedForward, MultiLoraStack, PendingRequest,
    QueueDispatcher, RunConfig,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

/// Adapter name used for requests when the run file declares none.
const BASE_ONLY: &str = "base";

#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub layers: usize,
    pub hidden: usize,
    pub intermediate: usize,
    pub vocab: usize,
    pub requests: usize,
    pub max_request_len: usize,
    pub seed: Option<u64>,
    pub max_rows: Option<usize>,
    pub router_logits: bool,
    pub inference: bool,
    /// Greedy decoding steps per inference batch.
    pub max_new_tokens: usize,
    /// Rows stop decoding after emitting this token.
    pub eos_id: Option<u32>,
}

impl Default for SimulateOptions {
    fn default() -> Self {
        Self {
            layers: 2,
            hidden: 64,
            intermediate: 128,
            vocab: 512,
            requests: 32,
            max_request_len: 32,
            seed: None,
            max_rows: None,
            router_logits: false,
            inference: false,
            max_new_tokens: 0,
            eos_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterLoss {
    pub load_balancing: f32,
    pub z_loss: f32,
}

#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    pub batches: usize,
    pub rows: usize,
    pub tokens: usize,
    pub max_batch_rows: usize,
    /// Sum of absolute values of the final hidden states over valid rows.
    pub output_checksum: f64,
    /// Tokens appended by greedy decoding, over all batches.
    pub generated_tokens: usize,
    pub decode_steps: usize,
    pub losses: BTreeMap<String, AdapterLoss>,
}

impl SimulationReport {
    pub fn to_json(&self) -> serde_json::Value {
        let losses: serde_json::Map<String, serde_json::Value> = self
            .losses
            .iter()
            .map(|(name, loss)| {
                (
                    name.clone(),
                    serde_json::json!({
                        "load_balancing": loss.load_balancing,
                        "z_loss": loss.z_loss,
                    }),
                )
            })
            .collect();
        serde_json::json!({
            "batches": self.batches,
            "rows": self.rows,
            "tokens": self.tokens,
            "max_batch_rows": self.max_batch_rows,
            "output_checksum": self.output_checksum,
            "generated_tokens": self.generated_tokens,
            "decode_steps": self.decode_steps,
            "losses": losses,
        })
    }
}

fn random_weight(rng: &mut StdRng, rows: usize, cols: usize, device: &Device) -> anyhow::Result<Tensor> {
    let bound = 1.0 / (cols as f32).sqrt();
    let data: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(-bound..bound)).collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}

fn build_stack(
    rng: &mut StdRng,
    run: &RunConfig,
    opts: &SimulateOptions,
    device: &Device,
) -> anyhow::Result<MultiLoraStack<FrozenFeedForward>> {
    let mut layers = Vec::with_capacity(opts.layers);
    for _ in 0..opts.layers {
        layers.push(FrozenFeedForward::from_weights(
            random_weight(rng, opts.intermediate, opts.hidden, device)?,
            random_weight(rng, opts.intermediate, opts.hidden, device)?,
            random_weight(rng, opts.hidden, opts.intermediate, device)?,
            Activation::Silu,
        ));
    }

    let mut stack = MultiLoraStack::new(layers, opts.seed, device, DType::F32);
    for adapter in &run.lora {
        stack
            .register_adapter(adapter, None)
            .with_context(|| format!("registering adapter {:?}", adapter.name))?;
    }
    Ok(stack)
}

fn submit_requests(
    rng: &mut StdRng,
    dispatcher: &mut QueueDispatcher,
    run: &RunConfig,
    opts: &SimulateOptions,
) {
    let names: Vec<&str> = if run.lora.is_empty() {
        vec![BASE_ONLY]
    } else {
        run.lora.iter().map(|a| a.name.as_str()).collect()
    };
    let max_len = opts.max_request_len.max(1);
    for i in 0..opts.requests {
        let len = rng.gen_range(1..=max_len);
        let tokens = (0..len)
            .map(|_| rng.gen_range(0..opts.vocab as u32))
            .collect();
        let adapter = names[i % names.len()];
        dispatcher.submit(PendingRequest::new(adapter, tokens).with_prompt(format!("request-{i}")));
    }
}

/// Greedy decoding on one batch.
///
/// Each step routes the whole descriptor again, scores every unfinished
/// row's last hidden state against the tied embedding and appends the
/// argmax token. A row stops at `eos_id` or when it has no padding left.
/// Returns `(generated_tokens, steps)`.
fn decode(
    stack: &MultiLoraStack<FrozenFeedForward>,
    embedding: &Embedding,
    mut batch: BatchDescriptor,
    opts: &SimulateOptions,
    device: &Device,
) -> anyhow::Result<(usize, usize)> {
    let mut done: Vec<bool> = (0..batch.total_rows())
        .map(|row| batch.is_row_full(row) || batch.last_position(row).is_none())
        .collect();
    let mut generated = 0;
    let mut steps = 0;

    while steps < opts.max_new_tokens {
        let live: Vec<usize> = (0..batch.total_rows()).filter(|&row| !done[row]).collect();
        if live.is_empty() {
            break;
        }

        let hidden = embedding.forward(&batch.token_tensor(device)?)?;
        let (out, _) = stack.forward(&hidden, &batch)?;
        let mut last = Vec::with_capacity(live.len());
        for &row in &live {
            let pos = batch
                .last_position(row)
                .context("live row without tokens")?;
            last.push(out.get(row)?.get(pos)?);
        }
        let scores = Tensor::stack(&last, 0)?.matmul(&embedding.embeddings().t()?)?;
        let next: Vec<u32> = scores.argmax(D::Minus1)?.to_vec1()?;

        for (&row, &token) in live.iter().zip(&next) {
            batch.append_token(row, token)?;
            generated += 1;
            if opts.eos_id == Some(token) || batch.is_row_full(row) {
                done[row] = true;
            }
        }
        steps += 1;
    }

    debug!(generated, steps, "decoded batch");
    Ok((generated, steps))
}

/// Run every synthetic request through a randomly initialized model.
pub fn run(run: &RunConfig, opts: &SimulateOptions) -> anyhow::Result<SimulationReport> {
    run.validate().context("invalid run file")?;
    anyhow::ensure!(opts.layers > 0, "--layers must be positive");
    anyhow::ensure!(opts.vocab > 0, "--vocab must be positive");
    anyhow::ensure!(
        opts.max_new_tokens == 0 || opts.inference,
        "--max-new-tokens needs --inference"
    );

    let mut run = run.clone();
    if let Some(max_rows) = opts.max_rows {
        anyhow::ensure!(max_rows > 0, "--max-rows must be positive");
        run.max_rows = max_rows;
    }
    run.collect_router_logits |= opts.router_logits;

    let device = Device::Cpu;
    let mut rng = match opts.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let stack = build_stack(&mut rng, &run, opts, &device)?;
    let embedding = Embedding::new(
        random_weight(&mut rng, opts.vocab, opts.hidden, &device)?,
        opts.hidden,
    );
    info!(
        layers = stack.num_layers(),
        adapters = stack.adapter_names().len(),
        hidden = opts.hidden,
        "model initialized"
    );

    let mut dispatcher = QueueDispatcher::from_run_config(&run, opts.inference);
    submit_requests(&mut rng, &mut dispatcher, &run, opts);

    let mut report = SimulationReport::default();
    let mut collected: BTreeMap<&str, Vec<Tensor>> = BTreeMap::new();

    while let Some(batch) = dispatcher.next_batch() {
        let tokens = batch.token_tensor(&device)?;
        let hidden = embedding.forward(&tokens)?;
        let (out, logits) = stack.forward(&hidden, &batch)?;

        let mask = batch.attention_mask(&device)?.to_dtype(DType::F32)?.unsqueeze(2)?;
        report.output_checksum += out
            .abs()?
            .broadcast_mul(&mask)?
            .sum_all()?
            .to_scalar::<f32>()? as f64;

        if batch.collect_router_logits {
            for adapter in run.lora.iter().filter(|a| a.is_mixture()) {
                let per_adapter = adapter_router_logits(&batch, &logits, &adapter.name);
                collected
                    .entry(adapter.name.as_str())
                    .or_default()
                    .extend(per_adapter);
            }
        }

        let tokens: usize = batch.valid_length().iter().sum();
        debug!(
            batch = report.batches,
            rows = batch.total_rows(),
            slices = batch.slices().len(),
            tokens,
            "batch routed"
        );
        report.batches += 1;
        report.rows += batch.total_rows();
        report.tokens += tokens;
        report.max_batch_rows = report.max_batch_rows.max(batch.total_rows());

        if batch.is_inference && opts.max_new_tokens > 0 {
            let (generated, steps) = decode(&stack, &embedding, batch, opts, &device)?;
            report.generated_tokens += generated;
            report.decode_steps += steps;
        }
    }

    for (name, logits) in collected {
        if logits.is_empty() {
            continue;
        }
        let block = stack
            .layers()
            .first()
            .and_then(|layer| layer.registry().get(name));
        let Some(AdapterKind::Mixture(block)) = block.as_deref() else {
            continue;
        };
        let load_balancing =
            load_balancing_loss(&logits, block.num_experts(), block.experts_per_token())?
                .to_scalar::<f32>()?;
        let z_loss = router_z_loss(&logits)?.to_scalar::<f32>()?;
        info!(adapter = name, load_balancing, z_loss, "router losses");
        report.losses.insert(
            name.to_string(),
            AdapterLoss {
                load_balancing,
                z_loss,
            },
        );
    }

    Ok(report)
}
