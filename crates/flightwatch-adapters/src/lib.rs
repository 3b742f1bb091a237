//! Source, lookup and notification adapter contracts + FLIFO/fixture/Telegram implementations.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use flightwatch_core::RawFlightCard;
use flightwatch_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "flightwatch-adapters";

pub const DEFAULT_FLIFO_BASE_URL: &str = "https://www.aircanada.com";
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// One origin -> destination listing query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteQuery {
    pub route_id: String,
    pub origin: String,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub service_date: NaiveDate,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Secondary per-flight detail: FIN (tail) number and a possibly more specific
/// status text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResult {
    #[serde(default)]
    pub fin_number: Option<String>,
    #[serde(default)]
    pub status_text: Option<String>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_route(
        &self,
        ctx: &AdapterContext,
        route: &RouteQuery,
    ) -> Result<Vec<RawFlightCard>, AdapterError>;
}

#[async_trait]
pub trait LookupAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// `flight_number` is the canonical carrier-prefixed number; each adapter
    /// strips the prefix according to its own URL convention.
    async fn lookup(&self, ctx: &AdapterContext, flight_number: &str) -> Result<LookupResult, AdapterError>;
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Best-effort message delivery to a recipient.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), NotifyError>;
}

/// Removes a leading carrier code (case-insensitive) and surrounding blanks:
/// `"AC 8712"` -> `"8712"`.
pub fn strip_carrier_prefix(flight_number: &str, carrier: &str) -> String {
    let trimmed = flight_number.trim();
    let head = trimmed.get(..carrier.len());
    match head {
        Some(head) if head.eq_ignore_ascii_case(carrier) => trimmed[carrier.len()..].trim().to_string(),
        _ => trimmed.to_string(),
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("bad selector {css}: {e}")))
}

/// Text nodes of an element, trimmed, one per line. Mirrors how a rendered
/// card puts `Sched. 14:20` on its own line above the city name.
fn element_lines(element: ElementRef<'_>) -> Option<String> {
    let lines = element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn first_lines(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope.select(sel).next().and_then(element_lines)
}

/// Extract every `.ac-card` of a FLIFO search result page. Missing pieces stay
/// `None`; deciding whether a card is usable is the normalizer's job.
pub fn parse_flifo_cards(html: &str) -> Result<Vec<RawFlightCard>, AdapterError> {
    let document = Html::parse_document(html);
    let card_sel = selector(".ac-card")?;
    let number_sel = selector(".flight-number-status .flight-number")?;
    let status_sel = selector(".flight-number-status .flight-status")?;
    let origin_time_sel = selector(".flight-times .origin-info .origin-time")?;
    let origin_city_sel = selector(".flight-times .origin-info .origin-city")?;
    let dest_time_sel = selector(".flight-times .destination-info .destination-time")?;
    let dest_city_sel = selector(".flight-times .destination-info .destination-city")?;

    let cards = document
        .select(&card_sel)
        .map(|card| RawFlightCard {
            flight_number: first_lines(card, &number_sel),
            status_text: first_lines(card, &status_sel),
            origin_time: first_lines(card, &origin_time_sel),
            origin_city: first_lines(card, &origin_city_sel),
            destination_time: first_lines(card, &dest_time_sel),
            destination_city: first_lines(card, &dest_city_sel),
        })
        .collect::<Vec<_>>();
    Ok(cards)
}

/// Extract FIN number and detailed status from a FLIFO flight-details page.
/// A page without a FIN number counts as a failed lookup.
pub fn parse_flifo_detail(html: &str) -> Result<LookupResult, AdapterError> {
    let document = Html::parse_document(html);
    let fin_sel = selector(".fin-number")?;
    let status_sel = selector(".detailed-status")?;

    let fin_number = document
        .select(&fin_sel)
        .next()
        .and_then(element_lines)
        .ok_or_else(|| AdapterError::Message("fin-number not present on detail page".into()))?;
    let status_text = document
        .select(&status_sel)
        .next()
        .and_then(element_lines)
        .map(|s| s.replace('\n', " "));

    Ok(LookupResult {
        fin_number: Some(fin_number),
        status_text,
    })
}

/// Live FLIFO listing adapter.
#[derive(Debug, Clone)]
pub struct FlifoSourceAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl FlifoSourceAdapter {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn listing_url(&self, ctx: &AdapterContext, route: &RouteQuery) -> String {
        format!(
            "{}/flifo/search?o={}&d={}&t={}&c=ac&l=en",
            self.base_url.trim_end_matches('/'),
            route.origin,
            route.destination,
            ctx.service_date.format("%Y%m%d")
        )
    }
}

#[async_trait]
impl SourceAdapter for FlifoSourceAdapter {
    fn source_id(&self) -> &'static str {
        "flifo"
    }

    async fn fetch_route(
        &self,
        ctx: &AdapterContext,
        route: &RouteQuery,
    ) -> Result<Vec<RawFlightCard>, AdapterError> {
        let url = self.listing_url(ctx, route);
        let page = self.http.fetch_text(self.source_id(), &url).await?;
        let cards = parse_flifo_cards(&page.body)?;
        debug!(route = %route.route_id, cards = cards.len(), "parsed flifo listing");
        Ok(cards)
    }
}

/// Live FLIFO flight-details adapter. FLIFO detail URLs take the bare number.
#[derive(Debug, Clone)]
pub struct FlifoLookupAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl FlifoLookupAdapter {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn detail_url(&self, flight_number: &str) -> String {
        format!(
            "{}/flifo/flight-details?f={}",
            self.base_url.trim_end_matches('/'),
            strip_carrier_prefix(flight_number, "AC")
        )
    }
}

#[async_trait]
impl LookupAdapter for FlifoLookupAdapter {
    fn source_id(&self) -> &'static str {
        "flifo-detail"
    }

    async fn lookup(&self, _ctx: &AdapterContext, flight_number: &str) -> Result<LookupResult, AdapterError> {
        let url = self.detail_url(flight_number);
        let page = self.http.fetch_text(self.source_id(), &url).await?;
        parse_flifo_detail(&page.body)
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Offline source: `{root}/{route_id}.json` holds a JSON array of raw cards.
/// A missing file behaves like an unreachable route.
#[derive(Debug, Clone)]
pub struct FixtureSourceAdapter {
    root: PathBuf,
}

impl FixtureSourceAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn route_path(&self, route: &RouteQuery) -> PathBuf {
        self.root.join(format!("{}.json", route.route_id))
    }
}

#[async_trait]
impl SourceAdapter for FixtureSourceAdapter {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_route(
        &self,
        _ctx: &AdapterContext,
        route: &RouteQuery,
    ) -> Result<Vec<RawFlightCard>, AdapterError> {
        Ok(read_json_file(self.route_path(route))?)
    }
}

/// Offline lookup: `{root}/lookups.json` maps flight numbers to results.
#[derive(Debug, Clone)]
pub struct FixtureLookupAdapter {
    root: PathBuf,
}

impl FixtureLookupAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl LookupAdapter for FixtureLookupAdapter {
    fn source_id(&self) -> &'static str {
        "fixture-detail"
    }

    async fn lookup(&self, _ctx: &AdapterContext, flight_number: &str) -> Result<LookupResult, AdapterError> {
        let table: HashMap<String, LookupResult> = read_json_file(self.root.join("lookups.json"))?;
        let key = flight_number.split_whitespace().collect::<String>();
        table
            .get(&key)
            .cloned()
            .ok_or_else(|| AdapterError::Message(format!("no lookup fixture for {key}")))
    }
}

#[derive(Debug, Serialize)]
struct TelegramMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Telegram Bot API `sendMessage` sink.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    http: Arc<HttpFetcher>,
    api_base: String,
    token: String,
}

impl TelegramNotifier {
    pub fn new(http: Arc<HttpFetcher>, token: impl Into<String>) -> Self {
        Self {
            http,
            api_base: DEFAULT_TELEGRAM_API_BASE.to_string(),
            token: token.into(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn send_message_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.token
        )
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), NotifyError> {
        if recipient.trim().is_empty() {
            return Err(NotifyError::Message("empty telegram chat id".into()));
        }
        let payload = TelegramMessage {
            chat_id: recipient,
            text,
        };
        self.http.post_json(&self.send_message_url(), &payload).await?;
        Ok(())
    }
}

/// Sink used when no transport is configured: the alert only goes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), NotifyError> {
        info!(recipient, message = text, "arrival notification");
        Ok(())
    }
}
