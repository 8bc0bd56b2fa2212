//! Request and response filters.
//!
//! Filters wrap endpoint execution: `on_request` runs on the session before the
//! endpoint is looked up and may answer the request itself; `on_response` runs
//! on successful responses before they are finalized. Global filters are
//! registered on the server builder; connection-create hooks may append
//! per-connection filters through a [`ConnectionPipeline`].

use std::sync::Arc;

use crate::http::{RequestInfo, RequestSummary, ResponseInfo};

/// Result of a request filter.
#[derive(Debug)]
pub enum FilterAction {
    Continue,
    /// Skip the endpoint and respond with this instead.
    ShortCircuit(ResponseInfo),
}

pub trait RequestFilter: Send + Sync + 'static {
    fn on_request(&self, _request: &mut RequestInfo) -> FilterAction {
        FilterAction::Continue
    }

    fn on_response(&self, _request: &RequestSummary, _response: &mut ResponseInfo) {}
}

/// Processing path assembled for one connection.
#[derive(Clone, Default)]
pub struct ConnectionPipeline {
    filters: Vec<Arc<dyn RequestFilter>>,
}

impl ConnectionPipeline {
    pub fn new(filters: Vec<Arc<dyn RequestFilter>>) -> Self {
        Self { filters }
    }

    pub fn add_filter(&mut self, filter: Arc<dyn RequestFilter>) {
        self.filters.push(filter);
    }

    pub fn filters(&self) -> &[Arc<dyn RequestFilter>] {
        &self.filters
    }

    /// Run request filters in order, stopping at the first short circuit.
    pub fn apply_request(&self, request: &mut RequestInfo) -> Option<ResponseInfo> {
        self.filters.iter().find_map(|filter| match filter.on_request(request) {
            FilterAction::Continue => None,
            FilterAction::ShortCircuit(response) => Some(response),
        })
    }

    /// Run response filters in reverse order so the outermost filter sees the final response.
    pub fn apply_response(&self, request: &RequestSummary, response: &mut ResponseInfo) {
        for filter in self.filters.iter().rev() {
            filter.on_response(request, response);
        }
    }
}
