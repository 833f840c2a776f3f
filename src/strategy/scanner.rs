//! Market scanner for funding-rate arbitrage targets.

use std::collections::HashMap;

use anyhow::Result;
use rust_decimal::Decimal;
use tracing::{debug, info, instrument, trace};

use crate::config::ScannerConfig;
use crate::exchange::{ExchangeGateway, Symbol, Venue};
use crate::utils::decimal::perp_spot_spread;

/// Snapshots older than this many ticks are silently omitted.
const STALE_TICKS: u64 = 2;

/// One symbol's market data at one instant.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    /// Predicted funding rate for the next interval.
    pub funding_rate: Decimal,
    pub spot_mid: Decimal,
    pub perp_mark: Decimal,
    /// 24-hour quote-denominated volume.
    pub volume_24h: Decimal,
    /// `(perp - spot) / spot`.
    pub spread: Decimal,
}

impl MarketSnapshot {
    pub fn new(
        symbol: Symbol,
        funding_rate: Decimal,
        spot_mid: Decimal,
        perp_mark: Decimal,
        volume_24h: Decimal,
    ) -> Self {
        let spread = perp_spot_spread(perp_mark, spot_mid);
        Self {
            symbol,
            funding_rate,
            spot_mid,
            perp_mark,
            volume_24h,
            spread,
        }
    }
}

/// A snapshot that passed every entry filter.
#[derive(Debug, Clone)]
pub struct TargetCandidate {
    pub snapshot: MarketSnapshot,
}

/// Reasons for rejecting a symbol during qualification.
#[derive(Debug, Clone, Copy)]
enum RejectReason {
    WrongQuote,
    LowFunding,
    LowVolume,
    ThinSpread,
    MissingData,
}

struct CachedSnapshot {
    tick: u64,
    snapshot: MarketSnapshot,
}

/// Periodically ranks the live symbol universe against the entry criteria.
///
/// Emits the full ranked list each tick; holds no diff state, only a small
/// per-symbol cache implementing the staleness window.
pub struct MarketScanner {
    config: ScannerConfig,
    quote: String,
    cache: HashMap<String, CachedSnapshot>,
    tick: u64,
}

impl MarketScanner {
    pub fn new(config: ScannerConfig, quote: &str) -> Self {
        Self {
            config,
            quote: quote.to_string(),
            cache: HashMap::new(),
            tick: 0,
        }
    }

    /// One scan tick: refresh data per symbol, apply filters, rank.
    ///
    /// Per-symbol data errors skip that symbol for this tick and never
    /// abort the scan. A tick yielding zero candidates is a valid outcome.
    #[instrument(skip(self, gateway))]
    pub async fn scan(&mut self, gateway: &dyn ExchangeGateway) -> Result<Vec<TargetCandidate>> {
        self.tick += 1;
        let symbols = gateway.list_perp_symbols(&self.quote).await?;

        let mut fetch_errors = 0usize;
        for symbol in &symbols {
            match self.fetch_snapshot(gateway, symbol).await {
                Ok(snapshot) => {
                    self.cache.insert(
                        symbol.market_name(),
                        CachedSnapshot {
                            tick: self.tick,
                            snapshot,
                        },
                    );
                }
                Err(e) => {
                    fetch_errors += 1;
                    debug!(%symbol, error = %e, "skipping symbol this tick");
                }
            }
        }

        // Drop entries past the staleness window so dead symbols don't
        // linger in the cache.
        let tick = self.tick;
        self.cache.retain(|_, c| tick - c.tick <= STALE_TICKS);

        let mut rejected: HashMap<&'static str, usize> = HashMap::new();
        let mut candidates: Vec<TargetCandidate> = Vec::new();
        for cached in self.cache.values() {
            match Self::qualify(&self.config, &self.quote, &cached.snapshot) {
                Ok(()) => candidates.push(TargetCandidate {
                    snapshot: cached.snapshot.clone(),
                }),
                Err(reason) => {
                    trace!(symbol = %cached.snapshot.symbol, ?reason, "rejected");
                    *rejected.entry(reason.name()).or_default() += 1;
                }
            }
        }

        Self::rank(&mut candidates);

        info!(
            universe = symbols.len(),
            qualified = candidates.len(),
            fetch_errors,
            ?rejected,
            "scan complete"
        );
        Ok(candidates)
    }

    async fn fetch_snapshot(
        &self,
        gateway: &dyn ExchangeGateway,
        symbol: &Symbol,
    ) -> Result<MarketSnapshot> {
        let (funding_rate, spot, perp, volume) = tokio::try_join!(
            gateway.fetch_funding_rate(symbol),
            gateway.fetch_ticker(Venue::Spot, symbol),
            gateway.fetch_ticker(Venue::Perp, symbol),
            gateway.fetch_24h_volume(symbol),
        )?;

        Ok(MarketSnapshot::new(
            symbol.clone(),
            funding_rate,
            spot.mid(),
            perp.mid(),
            volume,
        ))
    }

    /// Entry filter; all criteria must hold.
    fn qualify(
        config: &ScannerConfig,
        quote: &str,
        snapshot: &MarketSnapshot,
    ) -> Result<(), RejectReason> {
        if snapshot.symbol.quote() != quote {
            return Err(RejectReason::WrongQuote);
        }
        if snapshot.spot_mid <= Decimal::ZERO || snapshot.perp_mark <= Decimal::ZERO {
            return Err(RejectReason::MissingData);
        }
        if snapshot.funding_rate < config.min_funding_rate {
            return Err(RejectReason::LowFunding);
        }
        if snapshot.volume_24h < config.min_volume_24h {
            return Err(RejectReason::LowVolume);
        }
        if snapshot.spread < config.min_spread || snapshot.spread <= Decimal::ZERO {
            return Err(RejectReason::ThinSpread);
        }
        Ok(())
    }

    /// Funding rate descending, then 24h volume descending, then symbol
    /// lexicographic. Deterministic for identical snapshots.
    fn rank(candidates: &mut [TargetCandidate]) {
        candidates.sort_by(|a, b| {
            b.snapshot
                .funding_rate
                .cmp(&a.snapshot.funding_rate)
                .then(b.snapshot.volume_24h.cmp(&a.snapshot.volume_24h))
                .then(a.snapshot.symbol.market_name().cmp(&b.snapshot.symbol.market_name()))
        });
    }
}

impl RejectReason {
    fn name(&self) -> &'static str {
        match self {
            RejectReason::WrongQuote => "wrong_quote",
            RejectReason::LowFunding => "low_funding",
            RejectReason::LowVolume => "low_volume",
            RejectReason::ThinSpread => "thin_spread",
            RejectReason::MissingData => "missing_data",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockGateway;
    use crate::exchange::InstrumentRules;
    use rust_decimal_macros::dec;

    fn test_config() -> ScannerConfig {
        ScannerConfig {
            min_funding_rate: dec!(0.0003),
            min_volume_24h: dec!(10_000_000),
            min_spread: dec!(0.002),
        }
    }

    fn symbol(base: &str) -> Symbol {
        Symbol::new(base, "USDT").unwrap()
    }

    fn snapshot(base: &str, fr: Decimal, spot: Decimal, perp: Decimal, vol: Decimal) -> MarketSnapshot {
        MarketSnapshot::new(symbol(base), fr, spot, perp, vol)
    }

    fn unit_rules() -> InstrumentRules {
        InstrumentRules {
            min_qty: dec!(1),
            step_size: dec!(1),
            tick_size: dec!(0.00001),
        }
    }

    // =========================================================================
    // Filter tests
    // =========================================================================

    #[test]
    fn test_qualify_accepts_contango_with_edge() {
        let snap = snapshot("DOGE", dec!(0.0004), dec!(0.10), dec!(0.1003), dec!(20_000_000));
        assert!(MarketScanner::qualify(&test_config(), "USDT", &snap).is_ok());
    }

    #[test]
    fn test_funding_rate_boundary_is_inclusive() {
        // Exactly at the threshold must pass.
        let snap = snapshot("DOGE", dec!(0.0003), dec!(0.10), dec!(0.1003), dec!(20_000_000));
        assert!(MarketScanner::qualify(&test_config(), "USDT", &snap).is_ok());

        let below = snapshot("DOGE", dec!(0.00029), dec!(0.10), dec!(0.1003), dec!(20_000_000));
        assert!(MarketScanner::qualify(&test_config(), "USDT", &below).is_err());
    }

    #[test]
    fn test_volume_filter() {
        let snap = snapshot("DOGE", dec!(0.0004), dec!(0.10), dec!(0.1003), dec!(9_999_999));
        assert!(MarketScanner::qualify(&test_config(), "USDT", &snap).is_err());

        let at = snapshot("DOGE", dec!(0.0004), dec!(0.10), dec!(0.1003), dec!(10_000_000));
        assert!(MarketScanner::qualify(&test_config(), "USDT", &at).is_ok());
    }

    #[test]
    fn test_spread_filter_requires_contango() {
        // Thin but positive spread.
        let thin = snapshot("DOGE", dec!(0.0004), dec!(0.10), dec!(0.1001), dec!(20_000_000));
        assert!(MarketScanner::qualify(&test_config(), "USDT", &thin).is_err());

        // Backwardation never qualifies regardless of magnitude.
        let inverted = snapshot("DOGE", dec!(0.0004), dec!(0.10), dec!(0.09), dec!(20_000_000));
        assert!(MarketScanner::qualify(&test_config(), "USDT", &inverted).is_err());
    }

    #[test]
    fn test_wrong_quote_rejected() {
        let snap = MarketSnapshot::new(
            Symbol::new("DOGE", "BUSD").unwrap(),
            dec!(0.0004),
            dec!(0.10),
            dec!(0.1003),
            dec!(20_000_000),
        );
        assert!(MarketScanner::qualify(&test_config(), "USDT", &snap).is_err());
    }

    #[test]
    fn test_zero_spot_price_rejected() {
        let snap = snapshot("DOGE", dec!(0.0004), Decimal::ZERO, dec!(0.1003), dec!(20_000_000));
        assert!(MarketScanner::qualify(&test_config(), "USDT", &snap).is_err());
    }

    // =========================================================================
    // Ranking tests
    // =========================================================================

    #[test]
    fn test_ranking_by_funding_then_volume_then_symbol() {
        let mut candidates: Vec<TargetCandidate> = vec![
            snapshot("AAA", dec!(0.0004), dec!(1), dec!(1.003), dec!(20_000_000)),
            snapshot("CCC", dec!(0.0008), dec!(1), dec!(1.003), dec!(20_000_000)),
            // Same funding as AAA, higher volume: ranks above AAA.
            snapshot("BBB", dec!(0.0004), dec!(1), dec!(1.003), dec!(50_000_000)),
            // Full tie with AAA except the name: lexicographic order.
            snapshot("AAB", dec!(0.0004), dec!(1), dec!(1.003), dec!(20_000_000)),
        ]
        .into_iter()
        .map(|snapshot| TargetCandidate { snapshot })
        .collect();

        MarketScanner::rank(&mut candidates);

        let order: Vec<String> = candidates
            .iter()
            .map(|c| c.snapshot.symbol.base().to_string())
            .collect();
        assert_eq!(order, vec!["CCC", "BBB", "AAA", "AAB"]);
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let build = || {
            let mut candidates: Vec<TargetCandidate> = vec![
                snapshot("AAA", dec!(0.0005), dec!(1), dec!(1.003), dec!(20_000_000)),
                snapshot("BBB", dec!(0.0005), dec!(1), dec!(1.003), dec!(20_000_000)),
                snapshot("CCC", dec!(0.0004), dec!(1), dec!(1.003), dec!(90_000_000)),
            ]
            .into_iter()
            .map(|snapshot| TargetCandidate { snapshot })
            .collect::<Vec<_>>();
            MarketScanner::rank(&mut candidates);
            candidates
                .iter()
                .map(|c| c.snapshot.symbol.market_name())
                .collect::<Vec<_>>()
        };
        assert_eq!(build(), build());
    }

    // =========================================================================
    // Scan loop tests
    // =========================================================================

    #[tokio::test]
    async fn test_scan_happy_path() {
        let gateway = MockGateway::new();
        gateway
            .add_market(
                &symbol("DOGE"),
                dec!(0.0004),
                dec!(0.10),
                dec!(0.1003),
                dec!(20_000_000),
                unit_rules(),
            )
            .await;

        let mut scanner = MarketScanner::new(test_config(), "USDT");
        let candidates = scanner.scan(&gateway).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].snapshot.spread, dec!(0.003));
    }

    #[tokio::test]
    async fn test_zero_candidates_is_not_an_error() {
        let gateway = MockGateway::new();
        let mut scanner = MarketScanner::new(test_config(), "USDT");
        let candidates = scanner.scan(&gateway).await.unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_stale_symbol_served_from_cache_then_omitted() {
        let gateway = MockGateway::new();
        let doge = symbol("DOGE");
        gateway
            .add_market(&doge, dec!(0.0004), dec!(0.10), dec!(0.1003), dec!(20_000_000), unit_rules())
            .await;

        let mut scanner = MarketScanner::new(test_config(), "USDT");
        assert_eq!(scanner.scan(&gateway).await.unwrap().len(), 1);

        // Break per-symbol data; the cached snapshot carries the symbol for
        // two more ticks, then it disappears silently.
        gateway.remove_ticker(Venue::Perp, &doge).await;
        assert_eq!(scanner.scan(&gateway).await.unwrap().len(), 1);
        assert_eq!(scanner.scan(&gateway).await.unwrap().len(), 1);
        assert_eq!(scanner.scan(&gateway).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_per_symbol_error_does_not_abort_tick() {
        let gateway = MockGateway::new();
        let doge = symbol("DOGE");
        let pepe = symbol("PEPE");
        gateway
            .add_market(&doge, dec!(0.0004), dec!(0.10), dec!(0.1003), dec!(20_000_000), unit_rules())
            .await;
        gateway
            .add_market(&pepe, dec!(0.0009), dec!(0.10), dec!(0.1003), dec!(20_000_000), unit_rules())
            .await;
        // PEPE loses its spot ticker entirely before the first scan.
        gateway.remove_ticker(Venue::Spot, &pepe).await;

        let mut scanner = MarketScanner::new(test_config(), "USDT");
        let candidates = scanner.scan(&gateway).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].snapshot.symbol, doge);
    }
}
