// Checks the checked-in offline fixtures against the fixture adapters.

use chrono::NaiveDate;
use flightwatch_adapters::{
    AdapterContext, FixtureLookupAdapter, FixtureSourceAdapter, LookupAdapter, RouteQuery,
    SourceAdapter,
};
use uuid::Uuid;

fn fixtures_root() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn ctx() -> AdapterContext {
    AdapterContext {
        run_id: Uuid::new_v4(),
        service_date: NaiveDate::from_ymd_opt(2025, 4, 13).unwrap(),
    }
}

#[tokio::test]
async fn every_route_fixture_parses_into_cards() {
    let source = FixtureSourceAdapter::new(fixtures_root());
    for (route_id, origin) in [("yul-ytz", "YUL"), ("yow-ytz", "YOW")] {
        let route = RouteQuery {
            route_id: route_id.into(),
            origin: origin.into(),
            destination: "YTZ".into(),
        };
        let cards = source.fetch_route(&ctx(), &route).await.unwrap();
        assert!(!cards.is_empty(), "{route_id} fixture is empty");
        assert!(cards.iter().all(|c| c.flight_number.is_some()));
    }
}

#[tokio::test]
async fn lookup_fixture_resolves_known_flight() {
    let lookup = FixtureLookupAdapter::new(fixtures_root());
    let result = lookup.lookup(&ctx(), "AC 8712").await.unwrap();
    assert_eq!(result.fin_number.as_deref(), Some("7723"));
    assert!(lookup.lookup(&ctx(), "AC0000").await.is_err());
}
