//! Chain - applies a list of interceptors in order.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, flatten_errs};
use crate::{Interceptor, RTCPReader, RTCPWriter, RTPReader, RTPWriter, StreamInfo};

/// Chain is an interceptor that runs all child interceptors in order.
///
/// Every bind threads the reader/writer returned by interceptor `i` into
/// interceptor `i + 1`. The chain owns its interceptors and is never
/// referenced by them.
pub struct Chain {
    interceptors: Vec<Arc<dyn Interceptor + Send + Sync>>,
}

impl Chain {
    /// Create a new chain from the given interceptors.
    pub fn new(interceptors: Vec<Arc<dyn Interceptor + Send + Sync>>) -> Self {
        Chain { interceptors }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

#[async_trait]
impl Interceptor for Chain {
    async fn bind_rtcp_reader(
        &self,
        mut reader: Arc<dyn RTCPReader + Send + Sync>,
    ) -> Arc<dyn RTCPReader + Send + Sync> {
        for icpr in &self.interceptors {
            reader = icpr.bind_rtcp_reader(reader).await;
        }
        reader
    }

    async fn bind_rtcp_writer(
        &self,
        mut writer: Arc<dyn RTCPWriter + Send + Sync>,
    ) -> Arc<dyn RTCPWriter + Send + Sync> {
        for icpr in &self.interceptors {
            writer = icpr.bind_rtcp_writer(writer).await;
        }
        writer
    }

    async fn bind_local_stream(
        &self,
        info: &StreamInfo,
        mut writer: Arc<dyn RTPWriter + Send + Sync>,
    ) -> Arc<dyn RTPWriter + Send + Sync> {
        for icpr in &self.interceptors {
            writer = icpr.bind_local_stream(info, writer).await;
        }
        writer
    }

    async fn unbind_local_stream(&self, info: &StreamInfo) {
        for icpr in &self.interceptors {
            icpr.unbind_local_stream(info).await;
        }
    }

    async fn bind_remote_stream(
        &self,
        info: &StreamInfo,
        mut reader: Arc<dyn RTPReader + Send + Sync>,
    ) -> Arc<dyn RTPReader + Send + Sync> {
        for icpr in &self.interceptors {
            reader = icpr.bind_remote_stream(info, reader).await;
        }
        reader
    }

    async fn unbind_remote_stream(&self, info: &StreamInfo) {
        for icpr in &self.interceptors {
            icpr.unbind_remote_stream(info).await;
        }
    }

    /// Closes every interceptor, collecting all failures in input order.
    async fn close(&self) -> Result<()> {
        let mut errs = Vec::with_capacity(self.interceptors.len());
        for icpr in &self.interceptors {
            errs.push(icpr.close().await);
        }
        flatten_errs(errs)
    }
}
