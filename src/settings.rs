//! Platform settings that administrators change at runtime (minimum
//! withdrawal amounts, conversion rates, the monetization switch).
//!
//! Raw values are parsed into a `SettingValue` once, where they enter the
//! process. Operations resolve a typed `LedgerSettings` at call time from a
//! `ConfigProvider`, usually through a `CachedSettings` with a bounded TTL.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;

use crate::error::LedgerError;
use crate::sql_types::PayoutMethod;

pub const MONETIZATION_ENABLED: &str = "monetization_enabled";
pub const DEFAULT_EARNINGS_PER_TOKEN: &str = "default_earnings_per_token";
pub const MIN_CREATOR_WITHDRAWAL: &str = "min_creator_withdrawal";
pub const MIN_BONUS_WITHDRAWAL: &str = "min_bonus_withdrawal";
pub const PAYOUT_METHODS: &str = "payout_methods";

#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Bool(bool),
    Integer(i64),
    Decimal(Decimal),
    Text(String),
}

impl SettingValue {
    /// Parses a raw stored value. Anything that is not a boolean or a number
    /// is kept as text.
    pub fn parse(raw: &str) -> SettingValue {
        let raw = raw.trim();
        match raw.to_ascii_lowercase().as_str() {
            "true" => return SettingValue::Bool(true),
            "false" => return SettingValue::Bool(false),
            _ => (),
        }
        if let Ok(value) = raw.parse::<i64>() {
            return SettingValue::Integer(value);
        }
        if let Ok(value) = Decimal::from_str(raw) {
            return SettingValue::Decimal(value);
        }
        SettingValue::Text(raw.to_string())
    }

    pub fn from_toml(value: &toml::Value) -> Result<SettingValue, LedgerError> {
        match value {
            toml::Value::Boolean(b) => Ok(SettingValue::Bool(*b)),
            toml::Value::Integer(i) => Ok(SettingValue::Integer(*i)),
            // Floats go through their shortest decimal representation
            toml::Value::Float(f) => Decimal::from_str(&f.to_string())
                .map(SettingValue::Decimal)
                .map_err(|err| LedgerError::Configuration {
                    err: format!("invalid decimal setting {}: {}", f, err),
                }),
            toml::Value::String(s) => Ok(SettingValue::parse(s)),
            toml::Value::Array(items) => {
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(s) => parts.push(s.to_string()),
                        None => {
                            return Err(LedgerError::Configuration {
                                err: format!("unsupported list item {}", item),
                            })
                        }
                    }
                }
                Ok(SettingValue::Text(parts.join(",")))
            }
            other => Err(LedgerError::Configuration {
                err: format!("unsupported setting value {}", other),
            }),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            SettingValue::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            SettingValue::Integer(i) => Some(Decimal::from(*i)),
            SettingValue::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SettingValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

pub type SettingsSnapshot = HashMap<String, SettingValue>;

pub trait ConfigProvider: Send + Sync {
    fn snapshot(&self) -> Result<SettingsSnapshot, LedgerError>;
}

/// Settings fixed at construction, e.g. the `[settings]` table of the
/// config file.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings {
    values: SettingsSnapshot,
}

impl StaticSettings {
    pub fn new(values: SettingsSnapshot) -> Self {
        Self { values }
    }

    pub fn from_toml(table: &HashMap<String, toml::Value>) -> Result<Self, LedgerError> {
        let mut values = SettingsSnapshot::new();
        for (key, value) in table {
            values.insert(key.clone(), SettingValue::from_toml(value)?);
        }
        Ok(Self { values })
    }

    pub fn with(mut self, key: &str, value: SettingValue) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }
}

impl ConfigProvider for StaticSettings {
    fn snapshot(&self) -> Result<SettingsSnapshot, LedgerError> {
        Ok(self.values.clone())
    }
}

/// Caches another provider's snapshot for `ttl`. `invalidate` forces the
/// next read through to the inner provider.
pub struct CachedSettings<P> {
    inner: P,
    ttl: Duration,
    cached: RwLock<Option<(Instant, Arc<SettingsSnapshot>)>>,
}

impl<P: ConfigProvider> CachedSettings<P> {
    pub fn new(inner: P, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cached: RwLock::new(None),
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut cached) = self.cached.write() {
            *cached = None;
        }
    }

    fn fresh(&self) -> Option<Arc<SettingsSnapshot>> {
        let cached = self.cached.read().ok()?;
        match &*cached {
            Some((loaded_at, snapshot)) if loaded_at.elapsed() < self.ttl => {
                Some(Arc::clone(snapshot))
            }
            _ => None,
        }
    }
}

impl<P: ConfigProvider> ConfigProvider for CachedSettings<P> {
    fn snapshot(&self) -> Result<SettingsSnapshot, LedgerError> {
        if let Some(snapshot) = self.fresh() {
            return Ok((*snapshot).clone());
        }
        let snapshot = Arc::new(self.inner.snapshot()?);
        if let Ok(mut cached) = self.cached.write() {
            *cached = Some((Instant::now(), Arc::clone(&snapshot)));
        }
        Ok((*snapshot).clone())
    }
}

/// Values from `primary` override `fallback`. If `primary` cannot be read
/// the fallback values are used alone.
pub struct LayeredSettings<P, F> {
    primary: P,
    fallback: F,
}

impl<P: ConfigProvider, F: ConfigProvider> LayeredSettings<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

impl<P: ConfigProvider, F: ConfigProvider> ConfigProvider for LayeredSettings<P, F> {
    fn snapshot(&self) -> Result<SettingsSnapshot, LedgerError> {
        let mut values = self.fallback.snapshot()?;
        match self.primary.snapshot() {
            Ok(primary) => values.extend(primary),
            Err(err) => warn!("using fallback settings: {}", err),
        }
        Ok(values)
    }
}

/// The typed view of the settings the ledger reads.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSettings {
    pub monetization_enabled: bool,
    pub default_earnings_per_token: Decimal,
    pub min_creator_withdrawal: Decimal,
    pub min_bonus_withdrawal: Decimal,
    pub payout_methods: Vec<PayoutMethod>,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            monetization_enabled: true,
            default_earnings_per_token: Decimal::new(1, 4),
            min_creator_withdrawal: Decimal::new(50, 0),
            min_bonus_withdrawal: Decimal::new(10, 0),
            payout_methods: vec![
                PayoutMethod::Paypal,
                PayoutMethod::BankTransfer,
                PayoutMethod::Crypto,
            ],
        }
    }
}

impl LedgerSettings {
    pub fn resolve(provider: &dyn ConfigProvider) -> Result<LedgerSettings, LedgerError> {
        Self::from_snapshot(&provider.snapshot()?)
    }

    /// Unset keys take their defaults; keys holding the wrong kind of value
    /// are configuration errors.
    pub fn from_snapshot(snapshot: &SettingsSnapshot) -> Result<LedgerSettings, LedgerError> {
        let defaults = LedgerSettings::default();

        let monetization_enabled = match snapshot.get(MONETIZATION_ENABLED) {
            Some(value) => value
                .as_bool()
                .ok_or_else(|| wrong_kind(MONETIZATION_ENABLED, value))?,
            None => defaults.monetization_enabled,
        };

        let payout_methods = match snapshot.get(PAYOUT_METHODS) {
            Some(value) => {
                let text = value
                    .as_text()
                    .ok_or_else(|| wrong_kind(PAYOUT_METHODS, value))?;
                text.split(',')
                    .filter(|part| !part.trim().is_empty())
                    .map(|part| {
                        part.parse::<PayoutMethod>()
                            .map_err(|err| LedgerError::Configuration { err })
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => defaults.payout_methods,
        };

        Ok(LedgerSettings {
            monetization_enabled,
            default_earnings_per_token: decimal_setting(
                snapshot,
                DEFAULT_EARNINGS_PER_TOKEN,
                defaults.default_earnings_per_token,
            )?,
            min_creator_withdrawal: decimal_setting(
                snapshot,
                MIN_CREATOR_WITHDRAWAL,
                defaults.min_creator_withdrawal,
            )?,
            min_bonus_withdrawal: decimal_setting(
                snapshot,
                MIN_BONUS_WITHDRAWAL,
                defaults.min_bonus_withdrawal,
            )?,
            payout_methods,
        })
    }
}

fn decimal_setting(
    snapshot: &SettingsSnapshot,
    key: &str,
    default: Decimal,
) -> Result<Decimal, LedgerError> {
    match snapshot.get(key) {
        Some(value) => {
            let decimal = value.as_decimal().ok_or_else(|| wrong_kind(key, value))?;
            if decimal < Decimal::ZERO {
                return Err(LedgerError::Configuration {
                    err: format!("{} must not be negative", key),
                });
            }
            Ok(decimal)
        }
        None => Ok(default),
    }
}

fn wrong_kind(key: &str, value: &SettingValue) -> LedgerError {
    LedgerError::Configuration {
        err: format!("setting {} has unexpected value {:?}", key, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        loads: AtomicUsize,
    }

    impl ConfigProvider for CountingProvider {
        fn snapshot(&self) -> Result<SettingsSnapshot, LedgerError> {
            let loads = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
            let mut values = SettingsSnapshot::new();
            values.insert(
                MIN_BONUS_WITHDRAWAL.to_string(),
                SettingValue::Integer(loads as i64),
            );
            Ok(values)
        }
    }

    #[test]
    fn test_parse_setting_values() {
        assert_eq!(SettingValue::parse("TRUE"), SettingValue::Bool(true));
        assert_eq!(SettingValue::parse(" false "), SettingValue::Bool(false));
        assert_eq!(SettingValue::parse("25"), SettingValue::Integer(25));
        assert_eq!(
            SettingValue::parse("0.0001"),
            SettingValue::Decimal(dec!(0.0001))
        );
        assert_eq!(
            SettingValue::parse("paypal,crypto"),
            SettingValue::Text("paypal,crypto".into())
        );
    }

    #[test]
    fn test_settings_defaults() {
        let settings = LedgerSettings::resolve(&StaticSettings::default()).unwrap();
        assert_eq!(settings, LedgerSettings::default());
        assert_eq!(settings.default_earnings_per_token, dec!(0.0001));
    }

    #[test]
    fn test_settings_overrides() {
        let provider = StaticSettings::default()
            .with(MONETIZATION_ENABLED, SettingValue::parse("false"))
            .with(MIN_CREATOR_WITHDRAWAL, SettingValue::parse("25.50"))
            .with(PAYOUT_METHODS, SettingValue::parse("paypal"));

        let settings = LedgerSettings::resolve(&provider).unwrap();
        assert!(!settings.monetization_enabled);
        assert_eq!(settings.min_creator_withdrawal, dec!(25.50));
        assert_eq!(settings.payout_methods, vec![PayoutMethod::Paypal]);
    }

    #[test]
    fn test_settings_wrong_kind() {
        let provider = StaticSettings::default()
            .with(MIN_BONUS_WITHDRAWAL, SettingValue::Text("lots".into()));
        assert!(LedgerSettings::resolve(&provider).is_err());

        let provider =
            StaticSettings::default().with(PAYOUT_METHODS, SettingValue::parse("paypal,venmo"));
        assert!(LedgerSettings::resolve(&provider).is_err());
    }

    #[test]
    fn test_toml_settings() {
        let table: HashMap<String, toml::Value> = toml::from_str(
            r#"
            monetization_enabled = true
            default_earnings_per_token = 0.0002
            min_creator_withdrawal = 20
            payout_methods = ["paypal", "bank_transfer"]
            "#,
        )
        .unwrap();
        let settings =
            LedgerSettings::resolve(&StaticSettings::from_toml(&table).unwrap()).unwrap();
        assert_eq!(settings.default_earnings_per_token, dec!(0.0002));
        assert_eq!(settings.min_creator_withdrawal, dec!(20));
        assert_eq!(
            settings.payout_methods,
            vec![PayoutMethod::Paypal, PayoutMethod::BankTransfer]
        );
    }

    struct Unreachable;

    impl ConfigProvider for Unreachable {
        fn snapshot(&self) -> Result<SettingsSnapshot, LedgerError> {
            Err(LedgerError::DatabaseError {
                err: "connection refused".into(),
            })
        }
    }

    #[test]
    fn test_layered_settings() {
        let fallback = StaticSettings::default()
            .with(MIN_CREATOR_WITHDRAWAL, SettingValue::Integer(20))
            .with(MIN_BONUS_WITHDRAWAL, SettingValue::Integer(5));
        let primary =
            StaticSettings::default().with(MIN_BONUS_WITHDRAWAL, SettingValue::Integer(15));

        let settings =
            LedgerSettings::resolve(&LayeredSettings::new(primary, fallback.clone())).unwrap();
        assert_eq!(settings.min_creator_withdrawal, dec!(20));
        assert_eq!(settings.min_bonus_withdrawal, dec!(15));

        let settings =
            LedgerSettings::resolve(&LayeredSettings::new(Unreachable, fallback)).unwrap();
        assert_eq!(settings.min_bonus_withdrawal, dec!(5));
    }

    #[test]
    fn test_cached_settings_ttl() {
        let cached = CachedSettings::new(
            CountingProvider {
                loads: AtomicUsize::new(0),
            },
            Duration::from_secs(3600),
        );

        let first = LedgerSettings::resolve(&cached).unwrap();
        let second = LedgerSettings::resolve(&cached).unwrap();
        assert_eq!(first.min_bonus_withdrawal, dec!(1));
        assert_eq!(second.min_bonus_withdrawal, dec!(1));

        cached.invalidate();
        let third = LedgerSettings::resolve(&cached).unwrap();
        assert_eq!(third.min_bonus_withdrawal, dec!(2));
    }

    #[test]
    fn test_cached_settings_expire() {
        let cached = CachedSettings::new(
            CountingProvider {
                loads: AtomicUsize::new(0),
            },
            Duration::from_secs(0),
        );

        LedgerSettings::resolve(&cached).unwrap();
        let second = LedgerSettings::resolve(&cached).unwrap();
        assert_eq!(second.min_bonus_withdrawal, dec!(2));
    }
}
