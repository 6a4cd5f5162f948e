#![allow(non_snake_case)]

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use log::warn;
use reqwest::{
    Client, StatusCode,
    header::{HeaderMap, RETRY_AFTER},
};
use serde::{Deserialize, Serialize};

use crate::{
    FetchError, FetcherRateLimit, Repository, RepositoryFetcher, SearchPage, SearchPageRequest,
    StdResult,
};

/// The GraphQL production endpoint for GitHub.
pub const GITHUB_GRAPHQL_ENDPOINT: &str = "https://api.github.com/graphql";

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const SEARCH_QUERY: &str = r#"
query ($query: String!, $first: Int!, $after: String) {
  search(query: $query, type: REPOSITORY, first: $first, after: $after) {
    edges {
      node {
        ... on Repository {
          databaseId
          name
          owner {
            login
          }
          createdAt
          stargazerCount
        }
      }
    }
    pageInfo {
      endCursor
      hasNextPage
    }
  }
  rateLimit {
    limit
    cost
    remaining
    resetAt
  }
}
"#;

#[derive(Deserialize, Debug)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize, Debug)]
struct GraphQlError {
    message: String,
    #[serde(rename = "type")]
    errorType: Option<String>,
}

#[derive(Deserialize, Debug)]
struct SearchQueryData {
    search: SearchResult,
    rateLimit: RateLimit,
}

#[derive(Deserialize, Debug)]
struct SearchResult {
    edges: Vec<Option<SearchEdge>>,
    pageInfo: PageInfo,
}

#[derive(Deserialize, Debug)]
struct SearchEdge {
    node: Option<RepositoryNode>,
}

#[derive(Deserialize, Debug)]
struct RepositoryNode {
    databaseId: Option<i64>,
    name: String,
    owner: Owner,
    createdAt: Option<DateTime<Utc>>,
    stargazerCount: u32,
}

#[derive(Deserialize, Debug)]
struct Owner {
    login: String,
}

#[derive(Deserialize, Debug)]
struct PageInfo {
    endCursor: Option<String>,
    hasNextPage: bool,
}

#[derive(Deserialize, Debug)]
struct RateLimit {
    limit: i32,
    cost: i32,
    remaining: i32,
    resetAt: String,
}

impl From<RateLimit> for FetcherRateLimit {
    fn from(rate_limit: RateLimit) -> Self {
        Self {
            limit: rate_limit.limit,
            cost: rate_limit.cost,
            remaining: rate_limit.remaining,
            reset_at: rate_limit.resetAt,
        }
    }
}

impl RepositoryNode {
    fn into_repository(self) -> Option<Repository> {
        let Some(id) = self.databaseId else {
            warn!(
                "Ignoring repository without identifier: {}/{}",
                self.owner.login, self.name
            );
            return None;
        };
        let repository = Repository::new(id, &self.owner.login, &self.name, self.stargazerCount);

        Some(match self.createdAt {
            Some(created_at) => repository.with_created_at(created_at),
            None => repository,
        })
    }
}

/// The body posted to the GraphQL endpoint.
#[derive(Debug, Serialize)]
struct GraphQlQuery<'a> {
    query: &'a str,
    variables: GraphQlSearchVariables,
}

/// The variables of the search query.
#[derive(Debug, Serialize)]
struct GraphQlSearchVariables {
    /// The search query string.
    query: String,
    /// The number of repositories to return.
    first: u16,
    /// The cursor for pagination.
    after: Option<String>,
}

impl From<&SearchPageRequest> for GraphQlSearchVariables {
    fn from(request: &SearchPageRequest) -> Self {
        Self {
            query: request.query.to_owned(),
            first: request.first,
            after: request.after.to_owned(),
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Extracts the delay the server asks to wait before retrying, if any.
///
/// `Retry-After` (seconds or HTTP date) wins over the `x-ratelimit-*` headers, which only give
/// a hint once the budget is spent.
fn throttling_hint(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(retry_after) = header_value(headers, RETRY_AFTER.as_str()) {
        let retry_after = retry_after.trim();
        if let Ok(seconds) = retry_after.parse::<u64>() {
            return Some(Duration::from_secs(seconds));
        }
        if let Ok(date) = DateTime::parse_from_rfc2822(retry_after) {
            return Some(
                (date.with_timezone(&Utc) - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO),
            );
        }
    }
    if header_value(headers, "x-ratelimit-remaining").map(str::trim) == Some("0") {
        let reset = header_value(headers, "x-ratelimit-reset")?.trim().parse::<i64>().ok()?;
        let reset = DateTime::<Utc>::from_timestamp(reset, 0)?;
        return Some((reset - now).to_std().unwrap_or(Duration::ZERO));
    }

    None
}

/// Classifies an unsuccessful HTTP response.
fn classify_http_error(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    now: DateTime<Utc>,
) -> FetchError {
    let message = format!("HTTP {status}: {}", body.trim());
    match status {
        StatusCode::UNAUTHORIZED => FetchError::Unauthorized(message),
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            match throttling_hint(headers, now) {
                Some(retry_after) => FetchError::Throttled {
                    retry_after: Some(retry_after),
                    message,
                },
                None if status == StatusCode::TOO_MANY_REQUESTS
                    || body.to_lowercase().contains("rate limit") =>
                {
                    FetchError::Throttled {
                        retry_after: None,
                        message,
                    }
                }
                None => FetchError::PermanentRequest(message),
            }
        }
        status if status.is_server_error() => FetchError::TransientNetwork(message),
        _ => FetchError::PermanentRequest(message),
    }
}

/// Turns a decoded GraphQL response into a page, or classifies its errors.
fn parse_search_response(
    response: GraphQlResponse<SearchQueryData>,
) -> Result<SearchPage, FetchError> {
    let errors = response
        .errors
        .iter()
        .map(|error| error.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    let Some(data) = response.data else {
        if response
            .errors
            .iter()
            .any(|error| error.errorType.as_deref() == Some("RATE_LIMITED"))
        {
            return Err(FetchError::Throttled {
                retry_after: None,
                message: errors,
            });
        }
        if response.errors.is_empty() {
            return Err(FetchError::Malformed(
                "Response has neither data nor errors".to_string(),
            ));
        }
        return Err(FetchError::PermanentRequest(errors));
    };
    if !errors.is_empty() {
        warn!("GraphQL response carries errors alongside data: {errors}");
    }

    let edges = data.search.edges.len();

    Ok(SearchPage::new(
        data.search
            .edges
            .into_iter()
            .filter_map(|edge| edge.and_then(|edge| edge.node))
            .filter_map(RepositoryNode::into_repository)
            .collect(),
        data.search.pageInfo.endCursor,
        data.search.pageInfo.hasNextPage,
        data.rateLimit.into(),
    )
    .with_edges(edges))
}

/// Fetches repository data from a GraphQL API.
pub struct GraphQlFetcher {
    client: Client,
    endpoint: String,
    api_token: String,
}

impl GraphQlFetcher {
    /// Creates a new `GraphQlFetcher` instance for the endpoint, authenticated with the token.
    pub fn try_new(endpoint: &str, api_token: &str) -> StdResult<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .with_context(|| "Failed to build the HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_token: api_token.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl RepositoryFetcher for GraphQlFetcher {
    async fn fetch(&self, request: &SearchPageRequest) -> Result<SearchPage, FetchError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_token)
            .json(&GraphQlQuery {
                query: SEARCH_QUERY,
                variables: request.into(),
            })
            .send()
            .await
            .map_err(|e| FetchError::TransientNetwork(e.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::TransientNetwork(e.to_string()))?;
        if !status.is_success() {
            return Err(classify_http_error(status, &headers, &body, Utc::now()));
        }
        let response = serde_json::from_str::<GraphQlResponse<SearchQueryData>>(&body)
            .map_err(|e| FetchError::Malformed(e.to_string()))?;

        parse_search_response(response)
    }
}
