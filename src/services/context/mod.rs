//! Context builder: turns a request payload into a bounded, deduped,
//! prioritized context string plus an estimated token count. Builds are
//! deterministic and cheap to cache.

pub mod retrieval;

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use fnv::FnvHasher;

pub use retrieval::{BasicRetriever, Chunk, RetrievalError, RetrievalInput, Retriever};

#[derive(Debug, Clone, Default)]
pub struct BuildInput {
    pub task: String,
    pub tenant_id: String,
    pub conversation_id: String,
    pub payload: Vec<u8>,
    pub max_input_tokens: i32,
    pub max_chunks: i32,
    pub context_window: i32,
}

#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub context_text: String,
    pub chunks: Vec<Chunk>,
    pub token_count: i32,
}

struct CachedBuild {
    output: BuildOutput,
    expires_at: Instant,
}

const BUILD_CACHE_TTL: Duration = Duration::from_secs(90);
const BUILD_CACHE_LIMIT: usize = 1024;

pub struct ContextBuilder {
    retriever: Arc<dyn Retriever>,
    cache: RwLock<HashMap<u64, CachedBuild>>,
}

impl ContextBuilder {
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self { retriever, cache: RwLock::new(HashMap::new()) }
    }

    pub async fn build(&self, input: BuildInput) -> Result<BuildOutput, RetrievalError> {
        let input = normalize_build_input(input);

        let cache_key = build_cache_key(&input);
        if let Some(cached) = self.cache_get(cache_key) {
            return Ok(cached);
        }

        let chunks = self
            .retriever
            .retrieve(RetrievalInput {
                task: input.task.clone(),
                tenant_id: input.tenant_id.clone(),
                conversation_id: input.conversation_id.clone(),
                payload: input.payload.clone(),
                context_window: input.context_window,
            })
            .await?;

        let mut chunks = dedupe_chunks(chunks);

        chunks.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut selected = Vec::with_capacity(chunks.len());
        let mut total_tokens = 0;
        for chunk in chunks {
            let estimated = estimate_tokens(&chunk.text);
            if estimated <= 0 {
                continue;
            }
            if total_tokens + estimated > input.max_input_tokens {
                continue;
            }
            selected.push(chunk);
            total_tokens += estimated;
            if selected.len() >= input.max_chunks as usize {
                break;
            }
        }

        if selected.is_empty() {
            let fallback =
                "Contexto minimo: sem dados suficientes no payload para composicao detalhada.";
            total_tokens = estimate_tokens(fallback);
            selected.push(Chunk { id: "fallback".to_string(), text: fallback.to_string(), score: 1.0 });
        }

        let mut rendered = String::from("Contexto priorizado:\n");
        for (index, chunk) in selected.iter().enumerate() {
            rendered.push_str(&format!("[{}] {}\n", index + 1, chunk.text));
        }

        let output = BuildOutput {
            context_text: rendered.trim_end().to_string(),
            chunks: selected,
            token_count: total_tokens,
        };
        self.cache_put(cache_key, &output);
        Ok(output)
    }

    fn cache_get(&self, key: u64) -> Option<BuildOutput> {
        {
            let cache = self.cache.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            match cache.get(&key) {
                Some(entry) if Instant::now() <= entry.expires_at => {
                    return Some(clone_output(&entry.output));
                }
                Some(_) => {}
                None => return None,
            }
        }
        let mut cache = self.cache.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.remove(&key);
        None
    }

    fn cache_put(&self, key: u64, output: &BuildOutput) {
        let now = Instant::now();
        let entry = CachedBuild { output: clone_output(output), expires_at: now + BUILD_CACHE_TTL };

        let mut cache = self.cache.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if cache.len() >= BUILD_CACHE_LIMIT {
            cache.retain(|_, cached| cached.expires_at >= now);
        }
        if cache.len() >= BUILD_CACHE_LIMIT {
            let earliest = cache
                .iter()
                .min_by_key(|(_, cached)| cached.expires_at)
                .map(|(cached_key, _)| *cached_key);
            if let Some(cached_key) = earliest {
                cache.remove(&cached_key);
            }
        }
        cache.insert(key, entry);
    }
}

fn normalize_build_input(mut input: BuildInput) -> BuildInput {
    let task = input.task.trim().to_lowercase();
    if input.max_input_tokens <= 0 {
        input.max_input_tokens = match task.as_str() {
            "suggestion" => 1600,
            "summary" => 3200,
            "report" => 5200,
            _ => 2500,
        };
    }
    if input.max_chunks <= 0 {
        input.max_chunks = match task.as_str() {
            "suggestion" => 6,
            "summary" => 10,
            "report" => 12,
            _ => 8,
        };
    }
    if input.context_window <= 0 {
        input.context_window = 20;
    }
    input
}

fn build_cache_key(input: &BuildInput) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(input.task.trim().to_lowercase().as_bytes());
    hasher.write(&[0]);
    hasher.write(input.tenant_id.trim().as_bytes());
    hasher.write(&[0]);
    hasher.write(input.conversation_id.trim().as_bytes());
    hasher.write(&[0]);
    hasher.write(
        format!("{}|{}|{}", input.max_input_tokens, input.max_chunks, input.context_window)
            .as_bytes(),
    );
    hasher.write(&[0]);
    hasher.write(&input.payload);
    hasher.finish()
}

fn clone_output(output: &BuildOutput) -> BuildOutput {
    BuildOutput {
        context_text: output.context_text.clone(),
        chunks: output.chunks.clone(),
        token_count: output.token_count,
    }
}

/// Per-fingerprint dedup keeping the highest-scoring chunk, preserving
/// first-seen order.
fn dedupe_chunks(chunks: Vec<Chunk>) -> Vec<Chunk> {
    if chunks.len() <= 1 {
        return chunks;
    }

    let mut best: HashMap<String, Chunk> = HashMap::with_capacity(chunks.len());
    let mut order = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let key = retrieval::fragment_fingerprint(&chunk.text);
        match best.get(&key) {
            None => {
                order.push(key.clone());
                best.insert(key, chunk);
            }
            Some(existing) if chunk.score > existing.score => {
                best.insert(key, chunk);
            }
            Some(_) => {}
        }
    }

    order.into_iter().filter_map(|key| best.remove(&key)).collect()
}

/// Rough token estimate: ceil-free chars/4 with a floor of one token per
/// non-empty fragment.
fn estimate_tokens(text: &str) -> i32 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0;
    }
    let count = (trimmed.chars().count() / 4) as i32;
    count.max(1)
}
