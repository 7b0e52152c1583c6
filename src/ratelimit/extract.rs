//! Caller-supplied extractors for identity and extra key context.
//!
//! Extractors may perform I/O and may fail. The limiter treats any failure
//! as an absent value.

use async_trait::async_trait;

use super::request::InboundRequest;

/// Error type returned by extractors.
pub type ExtractError = Box<dyn std::error::Error + Send + Sync>;

/// Resolves the authenticated identity of a request.
///
/// An empty string means the request is anonymous.
#[async_trait]
pub trait IdentityExtractor: Send + Sync {
    async fn identity(&self, req: &dyn InboundRequest) -> Result<String, ExtractError>;
}

/// Resolves extra context to fold into the request key.
#[async_trait]
pub trait ContextExtractor: Send + Sync {
    async fn context(
        &self,
        req: &dyn InboundRequest,
        params: &[String],
    ) -> Result<String, ExtractError>;
}

#[async_trait]
impl<F> IdentityExtractor for F
where
    F: Fn(&dyn InboundRequest) -> Result<String, ExtractError> + Send + Sync,
{
    async fn identity(&self, req: &dyn InboundRequest) -> Result<String, ExtractError> {
        self(req)
    }
}

#[async_trait]
impl<F> ContextExtractor for F
where
    F: Fn(&dyn InboundRequest, &[String]) -> Result<String, ExtractError> + Send + Sync,
{
    async fn context(
        &self,
        req: &dyn InboundRequest,
        params: &[String],
    ) -> Result<String, ExtractError> {
        self(req, params)
    }
}

/// Reads identity or context straight from request headers.
///
/// As an identity extractor it returns the value of its header. As a
/// context extractor it joins the non-empty values of the headers named by
/// the limiter's context parameters, falling back to its own header when no
/// parameters are configured.
#[derive(Debug, Clone)]
pub struct HeaderExtractor {
    header: String,
}

/// Separator between header values in an extracted context.
const CONTEXT_SEPARATOR: &str = ",";

impl HeaderExtractor {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    fn read(&self, req: &dyn InboundRequest, name: &str) -> String {
        req.header(name).unwrap_or_default().to_string()
    }
}

#[async_trait]
impl IdentityExtractor for HeaderExtractor {
    async fn identity(&self, req: &dyn InboundRequest) -> Result<String, ExtractError> {
        Ok(self.read(req, &self.header))
    }
}

#[async_trait]
impl ContextExtractor for HeaderExtractor {
    async fn context(
        &self,
        req: &dyn InboundRequest,
        params: &[String],
    ) -> Result<String, ExtractError> {
        if params.is_empty() {
            return Ok(self.read(req, &self.header));
        }

        let values: Vec<String> = params
            .iter()
            .map(|name| self.read(req, name))
            .filter(|value| !value.is_empty())
            .collect();
        Ok(values.join(CONTEXT_SEPARATOR))
    }
}
