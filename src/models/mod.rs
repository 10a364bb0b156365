mod candle;
mod settings;
mod timeframe;
pub mod indicators;

pub use candle::{Candle, CandleKey};
pub use indicators::IndicatorSnapshot;
pub use settings::{parse_date, parse_symbols, Settings, SyncConfig};
pub use timeframe::{boundary_of, duration, Grid, Timeframe};
