pub mod market_phase;

pub use market_phase::{MarketPhaseAnalyzer, PhaseAnalysis};
