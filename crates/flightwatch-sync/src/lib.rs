//! Scrape pipeline orchestration: normalize, dedupe, enrich, select, persist.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use flightwatch_adapters::{
    AdapterContext, AdapterError, FixtureLookupAdapter, FixtureSourceAdapter, FlifoLookupAdapter,
    FlifoSourceAdapter, LogNotifier, LookupAdapter, LookupResult, NotificationSink, RouteQuery,
    SourceAdapter, TelegramNotifier, DEFAULT_FLIFO_BASE_URL,
};
use flightwatch_core::{extract_clock, Flight, FlightStatus, RawFlightCard};
use flightwatch_storage::{HttpClientConfig, HttpFetcher, SnapshotStore};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod watcher;

pub use watcher::{ArrivalWatcher, TickOutcome, WatcherConfig, WatcherPhase, WatcherState};

pub const CRATE_NAME: &str = "flightwatch-sync";

pub const DEFAULT_DESTINATION: &str = "YTZ";
pub const DEFAULT_TRACKING_BASE_URL: &str = "https://www.flightradar24.com/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Live,
    Fixture,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub snapshot_path: PathBuf,
    pub routes_file: PathBuf,
    pub source_mode: SourceMode,
    pub fixtures_dir: PathBuf,
    pub flifo_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub enrich_delay_min_ms: u64,
    pub enrich_delay_max_ms: u64,
    pub scrape_interval_secs: u64,
    pub watch_interval_secs: u64,
    pub notify_threshold_minutes: i64,
    pub tracking_base_url: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("./flight_data.json"),
            routes_file: PathBuf::from("./routes.yaml"),
            source_mode: SourceMode::Live,
            fixtures_dir: PathBuf::from("./fixtures"),
            flifo_base_url: DEFAULT_FLIFO_BASE_URL.to_string(),
            user_agent: "flightwatch/0.1".to_string(),
            http_timeout_secs: 30,
            enrich_delay_min_ms: 1500,
            enrich_delay_max_ms: 3500,
            scrape_interval_secs: 900,
            watch_interval_secs: 120,
            notify_threshold_minutes: 5,
            tracking_base_url: DEFAULT_TRACKING_BASE_URL.to_string(),
            telegram_bot_token: None,
            telegram_chat_id: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            snapshot_path: env_nonempty("FLIGHTWATCH_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.snapshot_path),
            routes_file: env_nonempty("FLIGHTWATCH_ROUTES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.routes_file),
            source_mode: match env_nonempty("FLIGHTWATCH_SOURCE_MODE").as_deref() {
                Some("fixture") | Some("fixtures") => SourceMode::Fixture,
                _ => SourceMode::Live,
            },
            fixtures_dir: env_nonempty("FLIGHTWATCH_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.fixtures_dir),
            flifo_base_url: env_nonempty("FLIGHTWATCH_FLIFO_BASE_URL").unwrap_or(defaults.flifo_base_url),
            user_agent: env_nonempty("FLIGHTWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("FLIGHTWATCH_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            enrich_delay_min_ms: env_parse("FLIGHTWATCH_ENRICH_DELAY_MIN_MS", defaults.enrich_delay_min_ms),
            enrich_delay_max_ms: env_parse("FLIGHTWATCH_ENRICH_DELAY_MAX_MS", defaults.enrich_delay_max_ms),
            scrape_interval_secs: env_parse("FLIGHTWATCH_SCRAPE_INTERVAL_SECS", defaults.scrape_interval_secs),
            watch_interval_secs: env_parse("FLIGHTWATCH_WATCH_INTERVAL_SECS", defaults.watch_interval_secs),
            notify_threshold_minutes: env_parse(
                "FLIGHTWATCH_NOTIFY_THRESHOLD_MINUTES",
                defaults.notify_threshold_minutes,
            ),
            tracking_base_url: env_nonempty("FLIGHTWATCH_TRACKING_BASE_URL")
                .unwrap_or(defaults.tracking_base_url),
            telegram_bot_token: env_nonempty("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: env_nonempty("TELEGRAM_CHAT_ID"),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn politeness_delay(&self) -> PolitenessDelay {
        PolitenessDelay::from_millis(self.enrich_delay_min_ms, self.enrich_delay_max_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub route_id: String,
    pub origin: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_destination() -> String {
    DEFAULT_DESTINATION.to_string()
}

fn default_carriers() -> BTreeMap<String, String> {
    BTreeMap::from([("AC".to_string(), "JZA".to_string())])
}

/// `routes.yaml`: which origins to query for the destination, plus the carrier
/// code table for tracking links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRegistry {
    #[serde(default = "default_destination")]
    pub destination: String,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default = "default_carriers")]
    pub carriers: BTreeMap<String, String>,
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            routes: vec![
                RouteConfig {
                    route_id: "yul-ytz".into(),
                    origin: "YUL".into(),
                    enabled: true,
                },
                RouteConfig {
                    route_id: "yow-ytz".into(),
                    origin: "YOW".into(),
                    enabled: true,
                },
            ],
            carriers: default_carriers(),
        }
    }
}

impl RouteRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing route registry")
    }

    /// A missing file falls back to the built-in Montreal/Ottawa -> YTZ routes;
    /// a present but broken file is an error.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "route registry not found; using built-in routes");
                Ok(Self::default())
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn queries(&self) -> Vec<RouteQuery> {
        self.routes
            .iter()
            .filter(|r| r.enabled)
            .map(|r| RouteQuery {
                route_id: r.route_id.clone(),
                origin: r.origin.clone(),
                destination: self.destination.clone(),
            })
            .collect()
    }

    pub fn carrier_table(&self) -> CarrierTable {
        CarrierTable::new(self.carriers.clone())
    }
}

/// Marketing carrier prefix -> tracking-service carrier code.
#[derive(Debug, Clone, Default)]
pub struct CarrierTable {
    codes: BTreeMap<String, String>,
}

impl CarrierTable {
    pub fn new(codes: BTreeMap<String, String>) -> Self {
        let codes = codes
            .into_iter()
            .map(|(k, v)| (k.trim().to_ascii_uppercase(), v.trim().to_string()))
            .collect();
        Self { codes }
    }

    /// Replaces only the leading alphabetic prefix; unmapped prefixes pass through.
    pub fn tracking_code(&self, flight_number: &str) -> String {
        let compact = flight_number
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>();
        let split = compact
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(compact.len());
        let (prefix, number) = compact.split_at(split);
        match self.codes.get(&prefix.to_ascii_uppercase()) {
            Some(code) => format!("{code}{number}"),
            None => compact.clone(),
        }
    }

    pub fn tracking_url(&self, base_url: &str, flight_number: &str) -> String {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            self.tracking_code(flight_number)
        )
    }
}

/// Per-record normalization result.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizeOutcome {
    Accepted(Flight),
    /// Filtered by design (e.g. a connecting leg to another airport).
    Skipped(String),
    /// Expected fields absent or malformed.
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizeReport {
    pub accepted: usize,
    pub skipped: usize,
    pub failures: Vec<String>,
}

/// Splits `"Sched. 14:20\nToronto YTZ"` into the scheduled clock and the city.
fn split_city_text(text: &str) -> (Option<String>, String) {
    let mut scheduled = None;
    let mut city_parts = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.to_ascii_lowercase().starts_with("sched") {
            scheduled = scheduled.or_else(|| extract_clock(line));
        } else {
            city_parts.push(line);
        }
    }
    (scheduled, city_parts.join(" "))
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("missing {name}"))
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    destination_code: String,
}

impl Normalizer {
    pub fn new(destination_code: impl Into<String>) -> Self {
        Self {
            destination_code: destination_code.into().trim().to_ascii_uppercase(),
        }
    }

    pub fn normalize(&self, card: &RawFlightCard) -> NormalizeOutcome {
        match self.try_normalize(card) {
            Ok(outcome) => outcome,
            Err(reason) => NormalizeOutcome::Failed(reason),
        }
    }

    fn try_normalize(&self, card: &RawFlightCard) -> Result<NormalizeOutcome, String> {
        let flight_number = required(&card.flight_number, "flight number")?
            .split_whitespace()
            .collect::<String>();
        let (destination_scheduled, destination_city) =
            split_city_text(required(&card.destination_city, "destination city")?);
        if !destination_city
            .to_ascii_uppercase()
            .contains(&self.destination_code)
        {
            return Ok(NormalizeOutcome::Skipped(format!(
                "{flight_number} lands at {destination_city}, not {}",
                self.destination_code
            )));
        }

        let destination_actual = extract_clock(required(&card.destination_time, "destination time")?)
            .ok_or_else(|| format!("{flight_number}: unparseable destination time"))?;
        let origin_actual = extract_clock(required(&card.origin_time, "origin time")?)
            .ok_or_else(|| format!("{flight_number}: unparseable origin time"))?;
        let (origin_scheduled, origin_city) = split_city_text(required(&card.origin_city, "origin city")?);
        if origin_city.is_empty() || destination_city.is_empty() {
            return Err(format!("{flight_number}: empty city text"));
        }

        let status_text = card
            .status_text
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let status = FlightStatus::classify(&status_text);
        let status_text = if status_text.is_empty() {
            status.label().to_string()
        } else {
            status_text
        };

        Ok(NormalizeOutcome::Accepted(Flight {
            flight_number,
            status_text,
            status,
            origin_scheduled_time: origin_scheduled.unwrap_or_else(|| origin_actual.clone()),
            origin_actual_time: origin_actual,
            origin_city,
            destination_scheduled_time: destination_scheduled
                .unwrap_or_else(|| destination_actual.clone()),
            destination_actual_time: destination_actual,
            destination_city,
            tail_number: None,
            tracking_url: None,
        }))
    }

    pub fn normalize_batch(&self, cards: &[RawFlightCard]) -> (Vec<Flight>, NormalizeReport) {
        let mut flights = Vec::with_capacity(cards.len());
        let mut report = NormalizeReport::default();
        for card in cards {
            match self.normalize(card) {
                NormalizeOutcome::Accepted(flight) => {
                    report.accepted += 1;
                    flights.push(flight);
                }
                NormalizeOutcome::Skipped(reason) => {
                    debug!(%reason, "card skipped");
                    report.skipped += 1;
                }
                NormalizeOutcome::Failed(reason) => {
                    warn!(%reason, "card could not be parsed");
                    report.failures.push(reason);
                }
            }
        }
        (flights, report)
    }
}

/// First occurrence of each leg wins; order is preserved.
pub fn dedupe(flights: Vec<Flight>) -> Vec<Flight> {
    let mut seen = HashSet::new();
    flights
        .into_iter()
        .filter(|flight| seen.insert(flight.key()))
        .collect()
}

/// Randomized pause between secondary lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolitenessDelay {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl PolitenessDelay {
    pub fn from_millis(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms: min_ms.min(max_ms),
            max_ms: min_ms.max(max_ms),
        }
    }

    pub fn none() -> Self {
        Self::from_millis(0, 0)
    }

    pub fn sample(&self) -> Duration {
        if self.max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnrichReport {
    pub enriched: usize,
    pub failures: Vec<String>,
}

pub struct Enricher {
    lookup: Arc<dyn LookupAdapter>,
    carriers: CarrierTable,
    tracking_base_url: String,
    call_timeout: Duration,
    delay: PolitenessDelay,
}

impl Enricher {
    pub fn new(
        lookup: Arc<dyn LookupAdapter>,
        carriers: CarrierTable,
        tracking_base_url: impl Into<String>,
        call_timeout: Duration,
        delay: PolitenessDelay,
    ) -> Self {
        Self {
            lookup,
            carriers,
            tracking_base_url: tracking_base_url.into(),
            call_timeout,
            delay,
        }
    }

    /// FIN from the lookup; its status overrides ours when it classifies to a
    /// known status that differs.
    pub fn apply_lookup(flight: &mut Flight, result: LookupResult) {
        if let Some(fin) = result
            .fin_number
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
        {
            flight.tail_number = Some(fin);
        }
        if let Some(text) = result.status_text.as_deref() {
            let refined = FlightStatus::classify(text);
            if refined != FlightStatus::Unknown && refined != flight.status {
                flight.set_status(refined);
            }
        }
    }

    pub fn derive_tracking_url(&self, flight: &mut Flight) {
        flight.tracking_url = if flight.status.is_airborne() {
            Some(
                self.carriers
                    .tracking_url(&self.tracking_base_url, &flight.flight_number),
            )
        } else {
            None
        };
    }

    async fn lookup_with_timeout(&self, ctx: &AdapterContext, flight_number: &str) -> Result<LookupResult, AdapterError> {
        match tokio::time::timeout(self.call_timeout, self.lookup.lookup(ctx, flight_number)).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Message(format!(
                "lookup timed out after {:?}",
                self.call_timeout
            ))),
        }
    }

    /// Sequential lookups with a politeness pause between them. A failed lookup
    /// leaves that flight as it was.
    pub async fn enrich_all(&self, ctx: &AdapterContext, flights: Vec<Flight>) -> (Vec<Flight>, EnrichReport) {
        let mut report = EnrichReport::default();
        let mut out = Vec::with_capacity(flights.len());
        for (index, mut flight) in flights.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.delay.sample()).await;
            }
            match self.lookup_with_timeout(ctx, &flight.flight_number).await {
                Ok(result) => {
                    Self::apply_lookup(&mut flight, result);
                    report.enriched += 1;
                }
                Err(err) => {
                    warn!(flight = %flight.flight_number, error = %err, "enrichment lookup failed");
                    report
                        .failures
                        .push(format!("{}: {err}", flight.flight_number));
                }
            }
            self.derive_tracking_url(&mut flight);
            out.push(flight);
        }
        (out, report)
    }
}

/// Soonest flight still to land, by the wraparound countdown. Arrived and
/// cancelled flights are not candidates; ties keep input order.
pub fn select_next_arrival(now: NaiveDateTime, flights: &[Flight]) -> Option<&Flight> {
    flights
        .iter()
        .filter(|f| !f.status.is_final())
        .filter_map(|f| f.time_until_arrival(now).map(|wait| (wait, f)))
        .min_by_key(|(wait, _)| *wait)
        .map(|(_, f)| f)
}

/// Stable chronological order starting from the soonest arrival; flights with
/// unparseable times go last.
pub fn sort_by_arrival(now: NaiveDateTime, flights: &mut [Flight]) {
    flights.sort_by_key(|f| {
        let wait = f.time_until_arrival(now);
        (wait.is_none(), wait)
    });
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteFailure {
    pub route_id: String,
    pub reason: String,
}

/// Per-invocation context; nothing here outlives one run.
#[derive(Debug)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub started_at: NaiveDateTime,
    pub adapter_ctx: AdapterContext,
    pub routes_attempted: usize,
    pub route_failures: Vec<RouteFailure>,
    pub raw_records: usize,
    pub normalize: NormalizeReport,
    pub deduplicated: usize,
    pub enrich: EnrichReport,
}

impl PipelineRun {
    pub fn new(now: NaiveDateTime) -> Self {
        let run_id = Uuid::new_v4();
        Self {
            run_id,
            started_at: now,
            adapter_ctx: AdapterContext {
                run_id,
                service_date: now.date(),
            },
            routes_attempted: 0,
            route_failures: Vec::new(),
            raw_records: 0,
            normalize: NormalizeReport::default(),
            deduplicated: 0,
            enrich: EnrichReport::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
    pub routes_attempted: usize,
    pub route_failures: Vec<RouteFailure>,
    pub raw_records: usize,
    pub normalize: NormalizeReport,
    pub deduplicated: usize,
    pub enrich: EnrichReport,
    pub total_flights: usize,
    pub next_arrival: Option<String>,
    pub snapshot_path: String,
    pub snapshot_sha256: String,
}

pub struct SyncPipeline {
    registry: RouteRegistry,
    source: Arc<dyn SourceAdapter>,
    normalizer: Normalizer,
    enricher: Enricher,
    store: SnapshotStore,
    call_timeout: Duration,
}

impl SyncPipeline {
    pub fn new(
        registry: RouteRegistry,
        source: Arc<dyn SourceAdapter>,
        enricher: Enricher,
        store: SnapshotStore,
        call_timeout: Duration,
    ) -> Self {
        let normalizer = Normalizer::new(registry.destination.clone());
        Self {
            registry,
            source,
            normalizer,
            enricher,
            store,
            call_timeout,
        }
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let registry = RouteRegistry::load_or_default(&config.routes_file).await?;
        let (source, lookup): (Arc<dyn SourceAdapter>, Arc<dyn LookupAdapter>) = match config.source_mode {
            SourceMode::Live => {
                let http = Arc::new(shared_http(config)?);
                (
                    Arc::new(FlifoSourceAdapter::new(http.clone(), config.flifo_base_url.clone())),
                    Arc::new(FlifoLookupAdapter::new(http, config.flifo_base_url.clone())),
                )
            }
            SourceMode::Fixture => (
                Arc::new(FixtureSourceAdapter::new(config.fixtures_dir.clone())),
                Arc::new(FixtureLookupAdapter::new(config.fixtures_dir.clone())),
            ),
        };
        let enricher = Enricher::new(
            lookup,
            registry.carrier_table(),
            config.tracking_base_url.clone(),
            config.call_timeout(),
            config.politeness_delay(),
        );
        Ok(Self::new(
            registry,
            source,
            enricher,
            SnapshotStore::new(config.snapshot_path.clone()),
            config.call_timeout(),
        ))
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        self.run_once_at(Local::now().naive_local()).await
    }

    /// One full scrape cycle evaluated against `now`. Only a failure to persist
    /// the snapshot is returned as an error.
    pub async fn run_once_at(&self, now: NaiveDateTime) -> Result<RunSummary> {
        let mut run = PipelineRun::new(now);
        let span = info_span!("scrape_run", run_id = %run.run_id);
        async {
            let cards = self.fetch_all_routes(&mut run).await;
            let (flights, report) = self.normalizer.normalize_batch(&cards);
            run.normalize = report;

            let flights = dedupe(flights);
            run.deduplicated = flights.len();

            let (mut flights, enrich_report) = self.enricher.enrich_all(&run.adapter_ctx, flights).await;
            run.enrich = enrich_report;

            let next = select_next_arrival(now, &flights).cloned();
            sort_by_arrival(now, &mut flights);
            if run.routes_attempted > 0 && run.route_failures.len() == run.routes_attempted {
                warn!("every route failed; writing an empty snapshot instead of keeping stale data");
            }

            let snapshot = flightwatch_core::Snapshot::new(now, next, flights);
            let stored = self
                .store
                .write(&snapshot)
                .await
                .context("persisting flight snapshot")?;

            let summary = RunSummary {
                run_id: run.run_id,
                started_at: run.started_at,
                finished_at: Local::now().naive_local(),
                routes_attempted: run.routes_attempted,
                route_failures: run.route_failures,
                raw_records: run.raw_records,
                normalize: run.normalize,
                deduplicated: run.deduplicated,
                enrich: run.enrich,
                total_flights: snapshot.total_flights,
                next_arrival: snapshot
                    .next_arrival_flight
                    .as_ref()
                    .map(|f| f.flight_number.clone()),
                snapshot_path: stored.path.display().to_string(),
                snapshot_sha256: stored.content_hash,
            };
            info!(
                flights = summary.total_flights,
                next = summary.next_arrival.as_deref().unwrap_or("none"),
                failed_routes = summary.route_failures.len(),
                "scrape run complete"
            );
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    async fn fetch_all_routes(&self, run: &mut PipelineRun) -> Vec<RawFlightCard> {
        let mut cards = Vec::new();
        for route in self.registry.queries() {
            run.routes_attempted += 1;
            let fetched = tokio::time::timeout(
                self.call_timeout,
                self.source.fetch_route(&run.adapter_ctx, &route),
            )
            .await;
            let reason = match fetched {
                Ok(Ok(route_cards)) => {
                    debug!(route = %route.route_id, cards = route_cards.len(), "route fetched");
                    run.raw_records += route_cards.len();
                    cards.extend(route_cards);
                    continue;
                }
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("timed out after {:?}", self.call_timeout),
            };
            warn!(route = %route.route_id, %reason, "route fetch failed; continuing without it");
            run.route_failures.push(RouteFailure {
                route_id: route.route_id.clone(),
                reason,
            });
        }
        cards
    }
}

fn shared_http(config: &SyncConfig) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: config.call_timeout(),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })
}

/// Telegram when both token and chat id are configured, else log-only.
pub fn notifier_from_config(config: &SyncConfig) -> Result<(Arc<dyn NotificationSink>, String)> {
    match (&config.telegram_bot_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) => {
            let http = Arc::new(shared_http(config)?);
            Ok((Arc::new(TelegramNotifier::new(http, token.clone())), chat_id.clone()))
        }
        _ => {
            warn!("TELEGRAM_BOT_TOKEN/TELEGRAM_CHAT_ID not set; notifications go to the log only");
            Ok((Arc::new(LogNotifier), "log".to_string()))
        }
    }
}

pub fn watcher_from_config(config: &SyncConfig) -> Result<ArrivalWatcher> {
    let (sink, recipient) = notifier_from_config(config)?;
    Ok(ArrivalWatcher::new(
        SnapshotStore::new(config.snapshot_path.clone()),
        sink,
        WatcherConfig {
            threshold_minutes: config.notify_threshold_minutes,
            recipient,
        },
    ))
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(&config).await?;
    pipeline.run_once().await
}

/// Two independent repeated jobs that only share the snapshot file. Overlapping
/// scrape ticks are skipped while a run is still in progress.
pub async fn build_scheduler(
    pipeline: Option<Arc<SyncPipeline>>,
    watcher: Option<Arc<Mutex<ArrivalWatcher>>>,
    config: &SyncConfig,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    if let Some(pipeline) = pipeline {
        let running = Arc::new(Mutex::new(()));
        let every = Duration::from_secs(config.scrape_interval_secs.max(1));
        let job = Job::new_repeated_async(every, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            let running = running.clone();
            Box::pin(async move {
                let Ok(_guard) = running.try_lock() else {
                    warn!("previous scrape still running; skipping this tick");
                    return;
                };
                if let Err(err) = pipeline.run_once().await {
                    error!(error = %err, "scrape run failed");
                }
            })
        })
        .context("creating scrape job")?;
        sched.add(job).await.context("adding scrape job")?;
    }

    if let Some(watcher) = watcher {
        let every = Duration::from_secs(config.watch_interval_secs.max(1));
        let job = Job::new_repeated_async(every, move |_uuid, _l| {
            let watcher = watcher.clone();
            Box::pin(async move {
                let outcome = watcher.lock().await.tick().await;
                debug!(?outcome, "watcher tick");
            })
        })
        .context("creating watcher job")?;
        sched.add(job).await.context("adding watcher job")?;
    }

    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use flightwatch_storage::SnapshotRead;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 4, 13)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn card(number: &str, status: &str, origin_time: &str, dest_time: &str, dest_city: &str) -> RawFlightCard {
        RawFlightCard {
            flight_number: Some(number.into()),
            status_text: Some(status.into()),
            origin_time: Some(origin_time.into()),
            origin_city: Some("Montreal YUL".into()),
            destination_time: Some(dest_time.into()),
            destination_city: Some(dest_city.into()),
        }
    }

    fn flight(number: &str, origin_time: &str, dest_time: &str) -> Flight {
        match Normalizer::new("YTZ").normalize(&card(number, "On Time", origin_time, dest_time, "Toronto YTZ")) {
            NormalizeOutcome::Accepted(f) => f,
            other => panic!("expected accepted flight, got {other:?}"),
        }
    }

    struct RouteTableSource {
        routes: HashMap<String, Result<Vec<RawFlightCard>, String>>,
    }

    #[async_trait]
    impl SourceAdapter for RouteTableSource {
        fn source_id(&self) -> &'static str {
            "table"
        }

        async fn fetch_route(
            &self,
            _ctx: &AdapterContext,
            route: &RouteQuery,
        ) -> Result<Vec<RawFlightCard>, AdapterError> {
            match self.routes.get(&route.route_id) {
                Some(Ok(cards)) => Ok(cards.clone()),
                Some(Err(reason)) => Err(AdapterError::Message(reason.clone())),
                None => Ok(Vec::new()),
            }
        }
    }

    struct HangingSource;

    #[async_trait]
    impl SourceAdapter for HangingSource {
        fn source_id(&self) -> &'static str {
            "hang"
        }

        async fn fetch_route(
            &self,
            _ctx: &AdapterContext,
            _route: &RouteQuery,
        ) -> Result<Vec<RawFlightCard>, AdapterError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    struct TableLookup {
        results: HashMap<String, LookupResult>,
    }

    #[async_trait]
    impl LookupAdapter for TableLookup {
        fn source_id(&self) -> &'static str {
            "table-lookup"
        }

        async fn lookup(&self, _ctx: &AdapterContext, flight_number: &str) -> Result<LookupResult, AdapterError> {
            self.results
                .get(flight_number)
                .cloned()
                .ok_or_else(|| AdapterError::Message("detail page missing fin".into()))
        }
    }

    fn enricher(results: HashMap<String, LookupResult>) -> Enricher {
        Enricher::new(
            Arc::new(TableLookup { results }),
            RouteRegistry::default().carrier_table(),
            DEFAULT_TRACKING_BASE_URL,
            Duration::from_secs(5),
            PolitenessDelay::none(),
        )
    }

    fn pipeline_with(source: Arc<dyn SourceAdapter>, store: SnapshotStore) -> SyncPipeline {
        SyncPipeline::new(
            RouteRegistry::default(),
            source,
            enricher(HashMap::new()),
            store,
            Duration::from_millis(200),
        )
    }

    #[test]
    fn normalizer_splits_scheduled_line_and_defaults_missing_schedule() {
        let raw = card("AC 8712", "Delayed", "13:25", "14:40", "Sched. 14:20\nToronto YTZ");
        let NormalizeOutcome::Accepted(f) = Normalizer::new("YTZ").normalize(&raw) else {
            panic!("expected accepted");
        };
        assert_eq!(f.flight_number, "AC8712");
        assert_eq!(f.status, FlightStatus::Delayed);
        assert_eq!(f.destination_scheduled_time, "14:20");
        assert_eq!(f.destination_actual_time, "14:40");
        assert_eq!(f.destination_city, "Toronto YTZ");
        assert_eq!(f.origin_scheduled_time, "13:25");
        assert_eq!(f.tail_number, None);
    }

    #[test]
    fn cancelled_and_delayed_text_classifies_as_cancelled() {
        let raw = card("AC1", "Delayed / Cancelled", "08:00", "09:10", "Toronto YTZ");
        let NormalizeOutcome::Accepted(f) = Normalizer::new("YTZ").normalize(&raw) else {
            panic!("expected accepted");
        };
        assert_eq!(f.status, FlightStatus::Cancelled);
        assert_eq!(f.status_text, "Delayed / Cancelled");
    }

    #[test]
    fn other_destination_is_skipped_not_failed() {
        let raw = card("AC2", "On Time", "08:00", "09:10", "Toronto YYZ");
        assert!(matches!(
            Normalizer::new("YTZ").normalize(&raw),
            NormalizeOutcome::Skipped(_)
        ));
    }

    #[test]
    fn malformed_record_fails_alone_and_batch_continues() {
        let cards = vec![
            card("AC1", "On Time", "08:00", "--:--", "Toronto YTZ"),
            RawFlightCard::default(),
            card("AC2", "On Time", "08:00", "09:10", "Toronto YYZ"),
            card("AC3", "On Time", "08:00", "09:30", "Toronto YTZ"),
        ];
        let (flights, report) = Normalizer::new("YTZ").normalize_batch(&cards);
        assert_eq!(flights.len(), 1);
        assert_eq!(flights[0].flight_number, "AC3");
        assert_eq!(report.accepted, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failures.len(), 2);
    }

    #[test]
    fn dedupe_keeps_first_and_is_idempotent() {
        let mut first = flight("AC123", "08:00", "09:10");
        first.status_text = "first".into();
        let mut dup = flight("AC123", "08:00", "09:10");
        dup.status_text = "second".into();
        let other_leg = flight("AC123", "12:00", "13:10");
        let list = vec![first.clone(), flight("AC5", "08:00", "09:00"), dup, other_leg];

        let once = dedupe(list);
        assert_eq!(once.len(), 3);
        assert_eq!(once[0], first);
        assert_eq!(dedupe(once.clone()), once);
    }

    #[test]
    fn carrier_table_replaces_only_the_prefix() {
        let table = RouteRegistry::default().carrier_table();
        assert_eq!(table.tracking_code("AC 8712"), "JZA8712");
        assert_eq!(table.tracking_code("WS123"), "WS123");
        assert_eq!(
            table.tracking_url(DEFAULT_TRACKING_BASE_URL, "AC8712"),
            "https://www.flightradar24.com/JZA8712"
        );
    }

    #[tokio::test]
    async fn enrichment_sets_fin_refines_status_and_links_airborne_flights() {
        let results = HashMap::from([(
            "AC8712".to_string(),
            LookupResult {
                fin_number: Some(" 7723 ".into()),
                status_text: Some("In flight".into()),
            },
        )]);
        let ctx = PipelineRun::new(at(12, 0)).adapter_ctx;
        let flights = vec![flight("AC8712", "13:05", "14:10"), flight("AC8714", "15:00", "16:05")];
        let (out, report) = enricher(results).enrich_all(&ctx, flights).await;

        assert_eq!(report.enriched, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(out[0].tail_number.as_deref(), Some("7723"));
        assert_eq!(out[0].status, FlightStatus::InFlight);
        assert_eq!(out[0].status_text, "In Flight");
        assert_eq!(
            out[0].tracking_url.as_deref(),
            Some("https://www.flightradar24.com/JZA8712")
        );
        // lookup failure keeps the flight as normalized
        assert_eq!(out[1], flight("AC8714", "15:00", "16:05"));
    }

    #[test]
    fn unknown_refined_status_does_not_override() {
        let mut f = flight("AC1", "08:00", "09:10");
        Enricher::apply_lookup(
            &mut f,
            LookupResult {
                fin_number: None,
                status_text: Some("Boarding soon".into()),
            },
        );
        assert_eq!(f.status, FlightStatus::OnTime);
    }

    #[test]
    fn next_arrival_wraps_past_midnight() {
        let flights = vec![flight("AC1", "22:00", "23:00"), flight("AC2", "23:30", "00:10")];
        let next = select_next_arrival(at(23, 50), &flights).unwrap();
        assert_eq!(next.flight_number, "AC2");
        assert_eq!(next.minutes_until_arrival(at(23, 50)), Some(20));
    }

    #[test]
    fn next_arrival_tie_keeps_input_order_and_skips_final_statuses() {
        let mut landed = flight("AC0", "08:00", "14:30");
        landed.set_status(FlightStatus::Arrived);
        let flights = vec![landed, flight("AC1", "13:00", "15:00"), flight("AC2", "13:10", "15:00")];
        assert_eq!(select_next_arrival(at(14, 0), &flights).unwrap().flight_number, "AC1");
        assert!(select_next_arrival(at(14, 0), &[]).is_none());
    }

    #[test]
    fn sort_starts_from_soonest_and_puts_wrapped_flights_after_same_day() {
        let mut flights = vec![
            flight("AC_MORNING", "06:00", "07:00"),
            flight("AC_LATE", "22:00", "23:30"),
            flight("AC_SOON", "19:00", "20:15"),
        ];
        sort_by_arrival(at(20, 0), &mut flights);
        let order = flights.iter().map(|f| f.flight_number.as_str()).collect::<Vec<_>>();
        assert_eq!(order, vec!["AC_SOON", "AC_LATE", "AC_MORNING"]);
    }

    #[tokio::test]
    async fn overlapping_routes_list_flight_once() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("flight_data.json"));
        let shared = card("AC123", "On Time", "13:00", "14:10", "Toronto YTZ");
        let source = RouteTableSource {
            routes: HashMap::from([
                ("yul-ytz".to_string(), Ok(vec![shared.clone()])),
                (
                    "yow-ytz".to_string(),
                    Ok(vec![shared, card("AC456", "On Time", "13:30", "14:30", "Toronto YTZ")]),
                ),
            ]),
        };
        let summary = pipeline_with(Arc::new(source), store.clone())
            .run_once_at(at(12, 0))
            .await
            .unwrap();

        assert_eq!(summary.raw_records, 3);
        assert_eq!(summary.deduplicated, 2);
        let snapshot = store.load().await.into_snapshot().unwrap();
        let count = snapshot
            .flights
            .iter()
            .filter(|f| f.flight_number == "AC123")
            .count();
        assert_eq!(count, 1);
        assert_eq!(snapshot.total_flights, 2);
        assert_eq!(snapshot.next_arrival_flight.unwrap().flight_number, "AC123");
    }

    #[tokio::test]
    async fn empty_source_still_writes_valid_empty_snapshot() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("flight_data.json"));
        let source = RouteTableSource {
            routes: HashMap::new(),
        };
        pipeline_with(Arc::new(source), store.clone())
            .run_once_at(at(12, 0))
            .await
            .unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["total_flights"], 0);
        assert!(value["next_arrival_flight"].is_null());
        assert_eq!(value["flights"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn all_routes_failing_replaces_stale_snapshot() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("flight_data.json"));
        let good = RouteTableSource {
            routes: HashMap::from([(
                "yul-ytz".to_string(),
                Ok(vec![card("AC123", "On Time", "13:00", "14:10", "Toronto YTZ")]),
            )]),
        };
        pipeline_with(Arc::new(good), store.clone())
            .run_once_at(at(12, 0))
            .await
            .unwrap();

        let broken = RouteTableSource {
            routes: HashMap::from([
                ("yul-ytz".to_string(), Err("connection reset".to_string())),
                ("yow-ytz".to_string(), Err("503".to_string())),
            ]),
        };
        let summary = pipeline_with(Arc::new(broken), store.clone())
            .run_once_at(at(12, 15))
            .await
            .unwrap();

        assert_eq!(summary.route_failures.len(), 2);
        match store.load().await {
            SnapshotRead::Loaded(snapshot) => {
                assert_eq!(snapshot.total_flights, 0);
                assert!(snapshot.next_arrival_flight.is_none());
                assert_eq!(snapshot.generated_at, at(12, 15));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hanging_route_is_bounded_by_timeout() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("flight_data.json"));
        let summary = pipeline_with(Arc::new(HangingSource), store)
            .run_once_at(at(12, 0))
            .await
            .unwrap();
        assert_eq!(summary.routes_attempted, 2);
        assert_eq!(summary.route_failures.len(), 2);
        assert!(summary.route_failures[0].reason.contains("timed out"));
    }

    #[test]
    fn route_registry_yaml_fills_defaults() {
        let registry = RouteRegistry::from_yaml(
            "routes:\n  - route_id: yul-ytz\n    origin: YUL\n  - route_id: yow-ytz\n    origin: YOW\n    enabled: false\n",
        )
        .unwrap();
        assert_eq!(registry.destination, "YTZ");
        let queries = registry.queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].origin, "YUL");
        assert_eq!(queries[0].destination, "YTZ");
        assert_eq!(registry.carrier_table().tracking_code("AC1"), "JZA1");
    }

    #[tokio::test]
    async fn missing_registry_file_uses_built_in_routes() {
        let dir = tempdir().unwrap();
        let registry = RouteRegistry::load_or_default(&dir.path().join("routes.yaml"))
            .await
            .unwrap();
        assert_eq!(registry.queries().len(), 2);
    }

    #[tokio::test]
    async fn fixture_mode_runs_against_workspace_fixtures() {
        let workspace = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let dir = tempdir().unwrap();
        let config = SyncConfig {
            snapshot_path: dir.path().join("flight_data.json"),
            routes_file: workspace.join("routes.yaml"),
            source_mode: SourceMode::Fixture,
            fixtures_dir: workspace.join("fixtures"),
            enrich_delay_min_ms: 0,
            enrich_delay_max_ms: 0,
            ..SyncConfig::default()
        };
        let pipeline = SyncPipeline::from_config(&config).await.unwrap();
        let summary = pipeline.run_once_at(at(14, 0)).await.unwrap();

        assert_eq!(summary.raw_records, 5);
        assert_eq!(summary.total_flights, 4);
        assert_eq!(summary.next_arrival.as_deref(), Some("AC8712"));

        let snapshot = pipeline.store().load().await.into_snapshot().unwrap();
        let ac8712 = snapshot
            .flights
            .iter()
            .find(|f| f.flight_number == "AC8712")
            .unwrap();
        assert_eq!(ac8712.tail_number.as_deref(), Some("7723"));
        assert_eq!(ac8712.destination_scheduled_time, "14:10");
        assert_eq!(
            ac8712.tracking_url.as_deref(),
            Some("https://www.flightradar24.com/JZA8712")
        );
        let cancelled = snapshot
            .flights
            .iter()
            .find(|f| f.flight_number == "AC8720")
            .unwrap();
        assert_eq!(cancelled.status, FlightStatus::Cancelled);
        assert!(cancelled.tracking_url.is_none());
    }

    #[test]
    fn politeness_delay_stays_in_range() {
        let delay = PolitenessDelay::from_millis(3500, 1500);
        for _ in 0..50 {
            let d = delay.sample();
            assert!(d >= Duration::from_millis(1500) && d <= Duration::from_millis(3500));
        }
        assert_eq!(PolitenessDelay::none().sample(), Duration::ZERO);
    }
}
