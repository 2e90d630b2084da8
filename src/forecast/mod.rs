pub mod tariff;

pub use tariff::*;

use std::sync::Arc;

use crate::config::TariffConfig;

pub fn build_tariff_source(cfg: &TariffConfig) -> anyhow::Result<Arc<dyn TariffSource>> {
    if !cfg.enabled {
        tracing::warn!("tariff integration disabled; precharge will never trigger");
        return Ok(Arc::new(DisabledTariff));
    }
    Ok(Arc::new(TempoTariffClient::new(cfg)?))
}
