use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Articles with a provider-assigned importance score at or above this
/// threshold are shared with the agents.
pub const MIN_IMPORTANCE_SCORE: Decimal = Decimal::from_parts(6, 0, 0, false, 1); // 0.6

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsArticle {
    pub title: String,
    pub summary: String,
    pub source: String,
    pub url: Option<String>,
    /// Trading symbols the provider associated with the article.
    pub symbols: Vec<String>,
    /// Provider-defined importance in [0, 1].
    pub importance_score: Decimal,
}

/// External news source (RSS scraper, API aggregator). The supervisor
/// only depends on this trait; fetching and scoring live outside the core.
#[async_trait]
pub trait NewsProvider: Send + Sync {
    async fn fetch_news(
        &self,
        limit_per_source: usize,
        max_total: usize,
    ) -> anyhow::Result<Vec<NewsArticle>>;
}

/// Keeps only articles at or above the importance threshold.
pub fn filter_important(articles: Vec<NewsArticle>, min_score: Decimal) -> Vec<NewsArticle> {
    articles
        .into_iter()
        .filter(|a| a.importance_score >= min_score)
        .collect()
}
