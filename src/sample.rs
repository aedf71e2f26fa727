//! Token sampling pipeline
//!
//! Transforms one fp32 logit vector into a sampled token id under a
//! composable set of logit-shaping policies, applied in a fixed order:
//!
//! repetition / frequency / presence penalties → temperature softmax →
//! min-p → top-k → top-p → tail-free → typical → categorical draw.
//!
//! A greedy fast path bypasses the whole chain. Sampling is a pure function
//! of `(logits, config-with-seed, recent token ids)`: the RNG is owned by
//! the [`Sampler`] and seeded from the configuration.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{ConversarError, Result};

/// Temperature at or below which sampling degenerates to argmax.
const GREEDY_TEMPERATURE: f32 = 1e-6;

// ============================================================================
// Configuration
// ============================================================================

/// Sampling configuration for one turn. Immutable once generation starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Softmax divisor; values at or below `1e-6` route to greedy
    pub temperature: f32,
    /// Keep the k most probable tokens; `0` disables
    pub top_k: usize,
    /// Nucleus cutoff; `>= 1` disables
    pub top_p: f32,
    /// Dynamic probability floor as a fraction of the max probability
    pub min_p: f32,
    /// Tail-free cutoff; `>= 1` disables
    pub tfs_z: f32,
    /// Typical-sampling cutoff; `>= 1` disables
    pub typical_p: f32,
    /// Multiplicative repetition penalty; `1.0` disables
    pub repetition_penalty: f32,
    /// Additive penalty per occurrence of a token in the recent history
    pub frequency_penalty: f32,
    /// Additive penalty per distinct token present in the recent history
    pub presence_penalty: f32,
    /// Generation cap per call, counting generated tokens only
    pub max_tokens: usize,
    /// PRNG seed; `None` seeds from process entropy
    pub seed: Option<u64>,
    /// Force argmax selection regardless of the other fields
    pub use_greedy: bool,
    /// Single-token stop ids
    pub stop_token_ids: Vec<i64>,
    /// Substring stops checked against the rolling decoded tail
    pub stop_sequences: Vec<String>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.0,
            tfs_z: 1.0,
            typical_p: 1.0,
            repetition_penalty: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            max_tokens: 2048,
            seed: None,
            use_greedy: false,
            stop_token_ids: vec![0, 2],
            stop_sequences: Vec::new(),
        }
    }
}

impl SamplingConfig {
    /// Greedy configuration
    #[must_use]
    pub fn greedy() -> Self {
        Self {
            use_greedy: true,
            ..Default::default()
        }
    }

    /// Set the temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set top-k
    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set top-p
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set min-p
    #[must_use]
    pub fn with_min_p(mut self, min_p: f32) -> Self {
        self.min_p = min_p;
        self
    }

    /// Set the tail-free cutoff
    #[must_use]
    pub fn with_tfs_z(mut self, tfs_z: f32) -> Self {
        self.tfs_z = tfs_z;
        self
    }

    /// Set the typical-sampling cutoff
    #[must_use]
    pub fn with_typical_p(mut self, typical_p: f32) -> Self {
        self.typical_p = typical_p;
        self
    }

    /// Set the repetition penalty
    #[must_use]
    pub fn with_repetition_penalty(mut self, penalty: f32) -> Self {
        self.repetition_penalty = penalty;
        self
    }

    /// Set the frequency penalty
    #[must_use]
    pub fn with_frequency_penalty(mut self, penalty: f32) -> Self {
        self.frequency_penalty = penalty;
        self
    }

    /// Set the presence penalty
    #[must_use]
    pub fn with_presence_penalty(mut self, penalty: f32) -> Self {
        self.presence_penalty = penalty;
        self
    }

    /// Set the generation cap
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the PRNG seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the single-token stop ids
    #[must_use]
    pub fn with_stop_token_ids(mut self, ids: Vec<i64>) -> Self {
        self.stop_token_ids = ids;
        self
    }

    /// Set the substring stops
    #[must_use]
    pub fn with_stop_sequences(mut self, sequences: Vec<String>) -> Self {
        self.stop_sequences = sequences;
        self
    }
}

// ============================================================================
// Model families
// ============================================================================

/// Known model families with their own stop-token conventions.
///
/// Adding a family is one new variant plus one overlay arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    /// Llama-3-style header-token models
    Llama3,
    /// ChatML-style models (Qwen2, Hermes, Yi)
    ChatMl,
    /// Unrecognized; the base defaults apply unchanged
    Generic,
}

impl ModelFamily {
    /// Guess the family from a model file name or identifier.
    #[must_use]
    pub fn detect(model_name: &str) -> Self {
        let name = model_name.to_ascii_lowercase();
        if name.contains("llama-3") || name.contains("llama3") {
            ModelFamily::Llama3
        } else if name.contains("qwen") || name.contains("hermes") || name.contains("chatml") {
            ModelFamily::ChatMl
        } else {
            ModelFamily::Generic
        }
    }

    /// Overlay family-specific defaults onto a configuration.
    ///
    /// Recognized families replace the stop-token set and stop sequences
    /// with their end-of-text / end-of-turn markers, floor the temperature
    /// at `0.1`, and ceiling top-p at `0.95`.
    #[must_use]
    pub fn apply_defaults(self, mut config: SamplingConfig) -> SamplingConfig {
        match self {
            ModelFamily::Llama3 => {
                config.stop_token_ids = vec![128_001, 128_009];
                config.stop_sequences =
                    vec!["<|eot_id|>".to_string(), "<|end_of_text|>".to_string()];
            }
            ModelFamily::ChatMl => {
                config.stop_token_ids = vec![151_643, 151_645];
                config.stop_sequences = vec!["<|im_end|>".to_string()];
            }
            ModelFamily::Generic => return config,
        }
        config.temperature = config.temperature.max(0.1);
        config.top_p = config.top_p.min(0.95);
        config
    }
}

// ============================================================================
// Sampler
// ============================================================================

/// Token sampler owning the PRNG for one session.
#[derive(Debug)]
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler seeded from the configuration (process entropy when
    /// no seed is set).
    #[must_use]
    pub fn new(config: &SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Sample the next token id from an fp32 logit vector.
    ///
    /// `recent` is the token history the penalty stages consult; an empty
    /// history leaves the logits untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ConversarError::InvalidArgument`] for an empty logit
    /// vector.
    pub fn sample(
        &mut self,
        logits: &[f32],
        config: &SamplingConfig,
        recent: &[i64],
    ) -> Result<i64> {
        if logits.is_empty() {
            return Err(ConversarError::invalid_argument("logits are empty"));
        }
        if config.use_greedy || config.temperature <= GREEDY_TEMPERATURE {
            return Ok(argmax(logits));
        }

        let mut shaped = logits.to_vec();
        apply_penalties(&mut shaped, config, recent);

        let mut probs = softmax_with_temperature(&shaped, config.temperature);
        apply_min_p(&mut probs, config.min_p);
        apply_top_k(&mut probs, config.top_k);
        apply_top_p(&mut probs, config.top_p);
        apply_tail_free(&mut probs, config.tfs_z);
        apply_typical(&mut probs, config.typical_p);

        let r: f32 = self.rng.gen();
        Ok(draw(&probs, r))
    }
}

/// Stable argmax: ties resolve to the lowest index.
fn argmax(logits: &[f32]) -> i64 {
    let mut best = 0;
    let mut best_val = logits[0];
    for (i, &v) in logits.iter().enumerate().skip(1) {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best as i64
}

/// Repetition, frequency, and presence penalties, in that order.
fn apply_penalties(logits: &mut [f32], config: &SamplingConfig, recent: &[i64]) {
    if recent.is_empty() {
        return;
    }
    let mut counts: HashMap<usize, u32> = HashMap::new();
    for &t in recent {
        if t >= 0 && (t as usize) < logits.len() {
            *counts.entry(t as usize).or_insert(0) += 1;
        }
    }

    let r = config.repetition_penalty;
    for (&t, &c) in &counts {
        if (r - 1.0).abs() > f32::EPSILON {
            let factor = r.powi(c as i32);
            if logits[t] > 0.0 {
                logits[t] /= factor;
            } else {
                logits[t] *= factor;
            }
        }
        logits[t] -= c as f32 * config.frequency_penalty;
        logits[t] -= config.presence_penalty;
    }
}

/// Max-subtracted softmax with a floored temperature divisor.
fn softmax_with_temperature(logits: &[f32], temperature: f32) -> Vec<f32> {
    let t = temperature.max(GREEDY_TEMPERATURE);
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| ((l - max) / t).exp()).collect();
    renormalize(&mut probs);
    probs
}

fn renormalize(probs: &mut [f32]) {
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
}

/// Zero every probability below `min_p` times the max probability.
fn apply_min_p(probs: &mut [f32], min_p: f32) {
    if min_p <= 0.0 {
        return;
    }
    let max = probs.iter().copied().fold(0.0f32, f32::max);
    let threshold = min_p * max;
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
    renormalize(probs);
}

/// Indices sorted by probability descending, ties by ascending index.
fn sorted_desc(probs: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]).then(a.cmp(&b)));
    order
}

/// Keep the k highest-probability entries.
fn apply_top_k(probs: &mut [f32], k: usize) {
    if k == 0 || k >= probs.len() {
        return;
    }
    let order = sorted_desc(probs);
    for &idx in &order[k..] {
        probs[idx] = 0.0;
    }
    renormalize(probs);
}

/// Nucleus cutoff: keep the smallest high-probability prefix whose
/// cumulative mass reaches `p`.
fn apply_top_p(probs: &mut [f32], p: f32) {
    if p >= 1.0 {
        return;
    }
    let order = sorted_desc(probs);
    let mut cumulative = 0.0f32;
    let mut cutoff = order.len();
    for (rank, &idx) in order.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative >= p {
            cutoff = rank + 1;
            break;
        }
    }
    for &idx in &order[cutoff..] {
        probs[idx] = 0.0;
    }
    renormalize(probs);
}

/// Tail-free cutoff over the first differences of the sorted distribution.
fn apply_tail_free(probs: &mut [f32], z: f32) {
    if z >= 1.0 {
        return;
    }
    let order = sorted_desc(probs);
    if order.len() < 2 {
        return;
    }
    let diffs: Vec<f32> = order
        .windows(2)
        .map(|w| probs[w[0]] - probs[w[1]])
        .collect();
    let total: f32 = diffs.iter().sum();
    if total <= 0.0 {
        return;
    }
    let mut cumulative = 0.0f32;
    let mut keep = order.len();
    for (i, d) in diffs.iter().enumerate() {
        cumulative += d / total;
        if cumulative >= z {
            keep = i + 1;
            break;
        }
    }
    for &idx in &order[keep..] {
        probs[idx] = 0.0;
    }
    renormalize(probs);
}

/// Typical sampling: rank by deviation of information content from the
/// distribution's entropy, keep mass up to `p`.
fn apply_typical(probs: &mut [f32], p: f32) {
    if p >= 1.0 {
        return;
    }
    let entropy: f32 = -probs
        .iter()
        .filter(|&&q| q > 0.0)
        .map(|&q| q * q.ln())
        .sum::<f32>();

    let mut order: Vec<usize> = (0..probs.len()).filter(|&i| probs[i] > 0.0).collect();
    order.sort_by(|&a, &b| {
        let da = (-probs[a].ln() - entropy).abs();
        let db = (-probs[b].ln() - entropy).abs();
        da.total_cmp(&db).then(a.cmp(&b))
    });

    let mut cumulative = 0.0f32;
    let mut keep = order.len();
    for (rank, &idx) in order.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative >= p {
            keep = rank + 1;
            break;
        }
    }
    let dropped: Vec<usize> = order[keep..].to_vec();
    for idx in dropped {
        probs[idx] = 0.0;
    }
    renormalize(probs);
}

/// Categorical draw: the first index whose cumulative mass reaches `r`.
fn draw(probs: &[f32], r: f32) -> i64 {
    let mut cumulative = 0.0f32;
    let mut last_nonzero = 0;
    for (i, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        last_nonzero = i;
        cumulative += p;
        if cumulative >= r {
            return i as i64;
        }
    }
    last_nonzero as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draw_many(logits: &[f32], config: &SamplingConfig, n: usize) -> Vec<i64> {
        let mut sampler = Sampler::new(config);
        (0..n)
            .map(|_| sampler.sample(logits, config, &[]).expect("sample"))
            .collect()
    }

    #[test]
    fn test_greedy_picks_argmax() {
        let mut sampler = Sampler::new(&SamplingConfig::greedy());
        let token = sampler
            .sample(&[-1.0, 0.5, 3.2, 3.19], &SamplingConfig::greedy(), &[])
            .expect("sample");
        assert_eq!(token, 2);
    }

    #[test]
    fn test_tiny_temperature_routes_to_greedy() {
        let config = SamplingConfig::default().with_temperature(1e-7).with_seed(9);
        let mut sampler = Sampler::new(&config);
        let token = sampler
            .sample(&[0.0, 2.0, 1.0], &config, &[])
            .expect("sample");
        assert_eq!(token, 1);
    }

    #[test]
    fn test_greedy_tie_breaks_to_lowest_index() {
        let mut sampler = Sampler::new(&SamplingConfig::greedy());
        let token = sampler
            .sample(&[1.0, 5.0, 5.0, 5.0], &SamplingConfig::greedy(), &[])
            .expect("sample");
        assert_eq!(token, 1);
    }

    #[test]
    fn test_top_k_constrains_support() {
        let config = SamplingConfig::default()
            .with_top_k(3)
            .with_temperature(1.0)
            .with_top_p(1.0)
            .with_seed(123);
        for token in draw_many(&[1.0, 2.0, 3.0, 4.0, 5.0], &config, 100) {
            assert!((2..=4).contains(&token), "token {token} outside top-3");
        }
    }

    #[test]
    fn test_low_temperature_favors_max() {
        let config = SamplingConfig::default()
            .with_top_k(5)
            .with_temperature(0.01)
            .with_top_p(1.0)
            .with_seed(7);
        let hits = draw_many(&[1.0, 2.0, 3.0, 4.0, 5.0], &config, 50)
            .into_iter()
            .filter(|&t| t == 4)
            .count();
        assert!(hits >= 40, "index 4 sampled only {hits}/50 times");
    }

    #[test]
    fn test_repetition_penalty_excludes_repeats() {
        let config = SamplingConfig::default()
            .with_repetition_penalty(1.2)
            .with_top_k(5)
            .with_temperature(0.1)
            .with_top_p(1.0)
            .with_seed(42);
        let mut sampler = Sampler::new(&config);
        let token = sampler
            .sample(&[1.0, 2.0, 3.0, 4.0, 5.0], &config, &[4, 4, 4])
            .expect("sample");
        assert_ne!(token, 4);
    }

    #[test]
    fn test_top_p_restricts_to_dominant_mass() {
        let config = SamplingConfig::default()
            .with_top_k(0)
            .with_top_p(0.5)
            .with_temperature(1.0)
            .with_seed(123);
        for token in draw_many(&[1.0, 1.0, 1.0, 10.0, 10.0], &config, 50) {
            assert!(token == 3 || token == 4, "token {token} outside nucleus");
        }
    }

    #[test]
    fn test_empty_history_leaves_logits_untouched() {
        let logits = [0.3, -1.0, 2.0, 0.7];
        let penalized = SamplingConfig::default()
            .with_repetition_penalty(1.5)
            .with_frequency_penalty(0.4)
            .with_presence_penalty(0.9)
            .with_seed(5);
        let plain = SamplingConfig::default().with_seed(5);

        let a = Sampler::new(&penalized)
            .sample(&logits, &penalized, &[])
            .expect("sample");
        let b = Sampler::new(&plain).sample(&logits, &plain, &[]).expect("sample");
        assert_eq!(a, b);
    }

    #[test]
    fn test_top_k_at_or_above_vocab_is_noop() {
        let logits = [0.1, 0.9, 0.4, 0.2];
        let wide = SamplingConfig::default().with_top_k(10).with_seed(31);
        let off = SamplingConfig::default().with_top_k(0).with_seed(31);
        let a = Sampler::new(&wide).sample(&logits, &wide, &[]).expect("sample");
        let b = Sampler::new(&off).sample(&logits, &off, &[]).expect("sample");
        assert_eq!(a, b);
    }

    #[test]
    fn test_top_p_at_or_above_one_is_noop() {
        let logits = [0.1, 0.9, 0.4, 0.2];
        let one = SamplingConfig::default().with_top_p(1.0).with_seed(77);
        let above = SamplingConfig::default().with_top_p(1.5).with_seed(77);
        let a = Sampler::new(&one).sample(&logits, &one, &[]).expect("sample");
        let b = Sampler::new(&above).sample(&logits, &above, &[]).expect("sample");
        assert_eq!(a, b);
    }

    #[test]
    fn test_seeded_sampling_is_deterministic() {
        let logits = [0.5, 1.5, 0.2, 2.5, 1.0];
        let config = SamplingConfig::default().with_seed(2024);
        let a = draw_many(&logits, &config, 20);
        let b = draw_many(&logits, &config, 20);
        assert_eq!(a, b);
    }

    #[test]
    fn test_min_p_zeroes_low_probability_tail() {
        let config = SamplingConfig::default()
            .with_top_k(0)
            .with_min_p(0.5)
            .with_temperature(1.0)
            .with_seed(13);
        // Probabilities of [0, 5] differ by e^5; min_p 0.5 removes index 0.
        for token in draw_many(&[0.0, 5.0], &config, 25) {
            assert_eq!(token, 1);
        }
    }

    #[test]
    fn test_tail_free_drops_flat_tail() {
        let config = SamplingConfig::default()
            .with_top_k(0)
            .with_top_p(1.0)
            .with_tfs_z(0.5)
            .with_temperature(1.0)
            .with_seed(99);
        // One dominant token, long flat tail: tfs keeps the head.
        let logits = [9.0, 2.0, 0.1, 0.1, 0.1, 0.1];
        for token in draw_many(&logits, &config, 40) {
            assert!(token <= 1, "token {token} from the flat tail survived");
        }
    }

    #[test]
    fn test_empty_logits_rejected() {
        let config = SamplingConfig::default();
        let err = Sampler::new(&config).sample(&[], &config, &[]);
        assert!(matches!(err, Err(ConversarError::InvalidArgument { .. })));
    }

    #[test]
    fn test_family_detection_and_overlay() {
        assert_eq!(
            ModelFamily::detect("Meta-Llama-3-8B-Instruct.onnx"),
            ModelFamily::Llama3
        );
        assert_eq!(ModelFamily::detect("qwen2-7b.onnx"), ModelFamily::ChatMl);
        assert_eq!(ModelFamily::detect("mystery.onnx"), ModelFamily::Generic);

        let config = SamplingConfig::default()
            .with_temperature(0.01)
            .with_top_p(0.99);
        let overlaid = ModelFamily::Llama3.apply_defaults(config.clone());
        assert_eq!(overlaid.stop_token_ids, vec![128_001, 128_009]);
        assert!(overlaid.stop_sequences.contains(&"<|eot_id|>".to_string()));
        assert_eq!(overlaid.temperature, 0.1);
        assert_eq!(overlaid.top_p, 0.95);

        let untouched = ModelFamily::Generic.apply_defaults(config.clone());
        assert_eq!(untouched, config);
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = SamplingConfig::default().with_seed(5).with_top_k(12);
        let json = serde_json::to_string(&config).expect("serialize");
        let back: SamplingConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);

        // Partial configurations fall back to the defaults.
        let partial: SamplingConfig =
            serde_json::from_str(r#"{"temperature": 0.2}"#).expect("partial");
        assert_eq!(partial.temperature, 0.2);
        assert_eq!(partial.top_k, 40);
        assert_eq!(partial.stop_token_ids, vec![0, 2]);
    }
}
