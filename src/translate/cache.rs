//! Persistent, content-addressed translation cache.
//!
//! Entries are keyed by the blake3 digest of the exact source text and stamped
//! with their creation time. The whole map is written to the injected
//! `CacheStore` after every insertion or eviction. When the store reports its
//! quota is exhausted the persisted copy is dropped and rewritten, and if that
//! still does not fit the oldest quarter of entries is evicted until it does.
//!
//! Concurrent requests for the same uncached text issue a single remote call:
//! the cache lookup and the pending-set insertion happen under one lock.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::normalize::detect_language;
use super::store::{CacheStore, StoreError};
use super::{Language, RemoteTranslator, TranslateError};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::scheduler::{Debounced, Debouncer};

/// Store key holding the serialized entry map.
pub const CACHE_STORE_KEY: &str = "translationCache";
/// Store key holding the active language code.
pub const LANGUAGE_STORE_KEY: &str = "preferredLanguage";

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// blake3 digest of a source text.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey([u8; 32]);

impl ContentKey {
    pub fn of(text: &str) -> Self {
        Self(*blake3::hash(text.as_bytes()).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({})", &self.to_hex()[..12])
    }
}

/// One cached translation. Older records used `en`/`hi`/`timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    #[serde(alias = "en")]
    pub source_text: String,
    #[serde(alias = "hi")]
    pub translated_text: String,
    /// Milliseconds since the Unix epoch.
    #[serde(alias = "timestamp")]
    pub created_at: u64,
}

/// Counter snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub remote_calls: u64,
    pub failures: u64,
    pub evictions: u64,
    pub evicted_entries: u64,
    pub quota_recoveries: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    remote_calls: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
    evicted_entries: AtomicU64,
    quota_recoveries: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct CacheState {
    entries: HashMap<ContentKey, CacheEntry>,
    pending: HashSet<ContentKey>,
    errors: HashMap<ContentKey, String>,
    language: Language,
}

/// Outcome of the synchronous part of `translate`.
enum Lookup {
    Ready(String),
    Remote {
        key: ContentKey,
        target: Language,
        translator: Arc<dyn RemoteTranslator>,
    },
    Miss(ContentKey),
}

pub struct TranslationCache {
    state: Mutex<CacheState>,
    store: Arc<dyn CacheStore>,
    translator: Option<Arc<dyn RemoteTranslator>>,
    debouncer: Debouncer<ContentKey>,
    persist_lock: Mutex<()>,
    counters: Counters,
    metrics: Arc<MetricsRegistry>,
}

impl TranslationCache {
    /// Build the cache, restoring entries and the active language from `store`.
    pub fn new(store: Arc<dyn CacheStore>, translator: Option<Arc<dyn RemoteTranslator>>) -> Self {
        let entries = load_entries(store.as_ref());
        let language = load_language(store.as_ref());
        info!(entries = entries.len(), language = %language, "translation cache loaded");

        Self {
            state: Mutex::new(CacheState {
                entries,
                pending: HashSet::new(),
                errors: HashMap::new(),
                language,
            }),
            store,
            translator,
            debouncer: Debouncer::new(DEFAULT_DEBOUNCE),
            persist_lock: Mutex::new(()),
            counters: Counters::default(),
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.debouncer = Debouncer::new(window);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Translate `text` into the active language.
    ///
    /// Never fails: on any problem the original text comes back, and a remote
    /// failure is recorded for `translation_error`. Only `eligible` text (model
    /// generated content) may trigger a remote call.
    pub async fn translate(&self, text: &str, eligible: bool) -> String {
        let (key, target, translator) = match self.lookup(text, eligible, true) {
            Lookup::Ready(out) => return out,
            Lookup::Remote { key, target, translator } => (key, target, translator),
            Lookup::Miss(_) => return text.to_string(),
        };
        let _pending = PendingGuard { cache: self, key };

        bump(&self.counters.remote_calls);
        let span = self.metrics.span(metric_names::TRANSLATE_REMOTE);
        let result = translator.translate(text, target).await;
        span.finish();

        match result {
            Ok(translated) => {
                let translated = translated.trim();
                if translated.is_empty() {
                    debug!(key = ?key, "remote translation came back empty");
                    return text.to_string();
                }
                if translated == text {
                    return text.to_string();
                }
                {
                    let mut state = self.state.lock();
                    state.entries.insert(
                        key,
                        CacheEntry {
                            source_text: text.to_string(),
                            translated_text: translated.to_string(),
                            created_at: now_ms(),
                        },
                    );
                }
                debug!(key = ?key, target = %target, "translation cached");
                self.persist();
                translated.to_string()
            }
            Err(e) => {
                bump(&self.counters.failures);
                self.metrics.record(metric_names::TRANSLATE_FAILED, 1.0);
                warn!(key = ?key, error = %e, "translation failed, keeping source text");
                self.state.lock().errors.insert(key, e.to_string());
                text.to_string()
            }
        }
    }

    /// Like `translate`, but misses wait out the debounce window first. A newer
    /// request for the same text during the window supersedes this one, and a
    /// request arriving while the remote call is in flight is folded into it;
    /// both get the original text back.
    pub async fn translate_debounced(&self, text: &str, eligible: bool) -> String {
        let key = match self.lookup(text, eligible, false) {
            Lookup::Ready(out) => return out,
            Lookup::Miss(key) | Lookup::Remote { key, .. } => key,
        };
        match self.debouncer.run(key, || self.translate(text, eligible)).await {
            Debounced::Completed(out) => out,
            Debounced::Superseded | Debounced::Coalesced => text.to_string(),
        }
    }

    /// Resolve everything that needs no network. With `claim`, a miss that
    /// should go remote is added to the pending set before the lock is released.
    fn lookup(&self, text: &str, eligible: bool, claim: bool) -> Lookup {
        if text.trim().is_empty() {
            return Lookup::Ready(text.to_string());
        }
        let key = ContentKey::of(text);
        let detected = detect_language(text);

        let mut state = self.state.lock();
        let target = state.language;
        if target.is_source() {
            return Lookup::Ready(text.to_string());
        }
        if let Some(entry) = state.entries.get(&key) {
            bump(&self.counters.hits);
            return Lookup::Ready(entry.translated_text.clone());
        }
        if !eligible {
            warn!(key = ?key, "text is not eligible for remote translation");
            return Lookup::Ready(text.to_string());
        }
        if state.pending.contains(&key) {
            return Lookup::Ready(text.to_string());
        }
        if detected == Some(target) {
            debug!(key = ?key, "text already in target language");
            return Lookup::Ready(text.to_string());
        }
        if !claim {
            return Lookup::Miss(key);
        }

        let Some(translator) = self.translator.clone() else {
            state.errors.insert(key, TranslateError::NotConfigured.to_string());
            return Lookup::Ready(text.to_string());
        };
        bump(&self.counters.misses);
        state.errors.remove(&key);
        state.pending.insert(key);
        Lookup::Remote { key, target, translator }
    }

    /// Cached translation for `text`, without side effects.
    pub fn cached(&self, text: &str) -> Option<String> {
        self.state
            .lock()
            .entries
            .get(&ContentKey::of(text))
            .map(|e| e.translated_text.clone())
    }

    pub fn language(&self) -> Language {
        self.state.lock().language
    }

    /// Switch the active language and remember it in the store.
    pub fn set_language(&self, language: Language) {
        self.state.lock().language = language;
        if let Err(e) = self.store.set(LANGUAGE_STORE_KEY, language.code()) {
            warn!(error = %e, "failed to persist language preference");
        }
        info!(language = %language, "language changed");
    }

    /// Whether any remote translation is in flight.
    pub fn is_translating(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Most recent remote failure for `text`, if its last attempt failed.
    pub fn translation_error(&self, text: &str) -> Option<String> {
        self.state.lock().errors.get(&ContentKey::of(text)).cloned()
    }

    pub fn translation_errors(&self) -> HashMap<ContentKey, String> {
        self.state.lock().errors.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and the persisted copy.
    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.entries.clear();
            state.errors.clear();
        }
        let _serial = self.persist_lock.lock();
        if let Err(e) = self.store.remove(CACHE_STORE_KEY) {
            warn!(error = %e, "failed to remove persisted translation cache");
        }
        info!("translation cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            entries: self.len(),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            remote_calls: c.remote_calls.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            evicted_entries: c.evicted_entries.load(Ordering::Relaxed),
            quota_recoveries: c.quota_recoveries.load(Ordering::Relaxed),
        }
    }

    /// Evict the oldest `ceil(25%)` of entries and persist. Returns how many
    /// entries were removed.
    pub fn evict_oldest_quarter(&self) -> usize {
        let evicted = self.evict_in_memory();
        if evicted > 0 {
            self.persist();
        }
        evicted
    }

    fn evict_in_memory(&self) -> usize {
        let mut state = self.state.lock();
        let total = state.entries.len();
        if total == 0 {
            return 0;
        }
        let count = total.div_ceil(4);

        let mut by_age: Vec<(u64, ContentKey)> = state.entries.iter().map(|(k, e)| (e.created_at, *k)).collect();
        by_age.sort_unstable();
        for (_, key) in by_age.into_iter().take(count) {
            state.entries.remove(&key);
        }

        bump(&self.counters.evictions);
        self.counters.evicted_entries.fetch_add(count as u64, Ordering::Relaxed);
        info!(evicted = count, remaining = total - count, "evicted oldest translations");
        count
    }

    /// Write the entry map to the store, recovering from quota exhaustion.
    fn persist(&self) {
        let _serial = self.persist_lock.lock();
        let span = self.metrics.span(metric_names::CACHE_PERSIST);

        match self.write_snapshot() {
            Ok(()) => {
                span.finish();
                return;
            }
            Err(StoreError::QuotaExceeded) => {}
            Err(e) => {
                warn!(error = %e, "failed to persist translation cache");
                return;
            }
        }

        bump(&self.counters.quota_recoveries);
        warn!("storage quota exceeded, clearing persisted translation cache");
        if let Err(e) = self.store.remove(CACHE_STORE_KEY) {
            warn!(error = %e, "failed to remove persisted translation cache");
        }

        loop {
            match self.write_snapshot() {
                Ok(()) => {
                    span.finish();
                    return;
                }
                Err(StoreError::QuotaExceeded) => {
                    if self.evict_in_memory() == 0 {
                        warn!("storage quota exceeded with an empty cache, nothing persisted");
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to persist translation cache");
                    return;
                }
            }
        }
    }

    fn write_snapshot(&self) -> Result<(), StoreError> {
        let serialized = {
            let state = self.state.lock();
            let record: HashMap<String, &CacheEntry> =
                state.entries.iter().map(|(k, e)| (k.to_hex(), e)).collect();
            serde_json::to_string(&record).map_err(|e| StoreError::Serialization(e.to_string()))?
        };
        self.store.set(CACHE_STORE_KEY, &serialized)
    }
}

/// Takes the key out of the pending set however the remote call ends.
struct PendingGuard<'a> {
    cache: &'a TranslationCache,
    key: ContentKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.cache.state.lock().pending.remove(&self.key);
    }
}

/// Read the persisted entry map. A missing record is an empty cache; a record
/// that is not a JSON object is discarded. Malformed entries are skipped and
/// keys are recomputed from the source text.
fn load_entries(store: &dyn CacheStore) -> HashMap<ContentKey, CacheEntry> {
    let raw = match store.get(CACHE_STORE_KEY) {
        Ok(Some(raw)) if !raw.trim().is_empty() => raw,
        Ok(_) => return HashMap::new(),
        Err(e) => {
            warn!(error = %e, "failed to read persisted translation cache");
            return HashMap::new();
        }
    };

    let record = match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&raw) {
        Ok(record) => record,
        Err(e) => {
            warn!(error = %e, "persisted translation cache is corrupt, discarding");
            if let Err(e) = store.remove(CACHE_STORE_KEY) {
                warn!(error = %e, "failed to remove corrupt translation cache");
            }
            return HashMap::new();
        }
    };

    let mut entries: HashMap<ContentKey, CacheEntry> = HashMap::with_capacity(record.len());
    let mut skipped = 0usize;
    for (_, value) in record {
        let entry = match serde_json::from_value::<CacheEntry>(value) {
            Ok(entry)
                if !entry.source_text.trim().is_empty()
                    && !entry.translated_text.trim().is_empty()
                    && entry.translated_text != entry.source_text =>
            {
                entry
            }
            _ => {
                skipped += 1;
                continue;
            }
        };
        let key = ContentKey::of(&entry.source_text);
        match entries.get(&key) {
            Some(existing) if existing.created_at >= entry.created_at => {}
            _ => {
                entries.insert(key, entry);
            }
        }
    }
    if skipped > 0 {
        warn!(skipped, "skipped malformed translation cache entries");
    }
    entries
}

fn load_language(store: &dyn CacheStore) -> Language {
    match store.get(LANGUAGE_STORE_KEY) {
        Ok(Some(code)) => Language::from_code(&code).unwrap_or(Language::SOURCE),
        Ok(None) => Language::SOURCE,
        Err(e) => {
            warn!(error = %e, "failed to read language preference");
            Language::SOURCE
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
