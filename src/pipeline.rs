use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::distributor::Distributor;
use crate::error::Result;
use crate::stream::processor::hooks_from_config;
use crate::stream::{
    Lifecycle, PacketSource, RtspStream, StreamInfo, StreamProcessor, StreamTranscoder, StreamType,
    Streamer,
};

/// Owns every stage of one relay and starts/stops them as a unit:
/// ingest, optional processor, transcoder, distributor.
pub struct PipelineManager {
    ingest: Arc<RtspStream>,
    processor: Option<Arc<StreamProcessor>>,
    transcoder: Arc<StreamTranscoder>,
    distributor: Arc<Distributor>,
    listen_address: String,
    lifecycle: tokio::sync::Mutex<()>,
    running: AtomicBool,
}

impl PipelineManager {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let ingest = Arc::new(RtspStream::new(config.rtsp.clone()));
        Self::with_ingest(config, ingest)
    }

    /// Build around an already-constructed ingest stage.
    pub fn with_ingest(config: &RelayConfig, ingest: Arc<RtspStream>) -> Result<Self> {
        let url = config.rtsp.url.as_str();

        let processor = if config.processor.enabled {
            let hooks = hooks_from_config(&config.processor)?;
            Some(Arc::new(StreamProcessor::new(
                ingest.clone(),
                hooks,
                StreamInfo::new(url, StreamType::Rtsp),
            )))
        } else {
            None
        };

        let source: Arc<dyn PacketSource> = match &processor {
            Some(processor) => processor.clone(),
            None => ingest.clone(),
        };
        let transcoder = Arc::new(StreamTranscoder::new(source, config.transcoder.clone(), url));

        let distributor = Arc::new(Distributor::new(
            config.distributor.clone(),
            config.transcoder.hls.output_dir.clone(),
        ));
        for stream in transcoder.streams() {
            distributor.register_stream(stream.clone());
        }

        Ok(Self {
            ingest,
            processor,
            transcoder,
            distributor,
            listen_address: config.distributor.listen_address.clone(),
            lifecycle: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
        })
    }

    pub fn ingest(&self) -> &Arc<RtspStream> {
        &self.ingest
    }

    pub fn processor(&self) -> Option<&Arc<StreamProcessor>> {
        self.processor.as_ref()
    }

    pub fn transcoder(&self) -> &Arc<StreamTranscoder> {
        &self.transcoder
    }

    pub fn distributor(&self) -> &Arc<Distributor> {
        &self.distributor
    }

    /// Client-facing URL of every output, using the bound address once running.
    pub fn output_urls(&self) -> HashMap<StreamType, String> {
        let host = self
            .distributor
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| self.listen_address.clone());
        self.transcoder.output_urls(&format!("http://{}", host))
    }

    async fn start_stages<'a>(&'a self, started: &mut Vec<&'a dyn Lifecycle>) -> Result<()> {
        self.ingest.start().await?;
        started.push(self.ingest.as_ref());

        if let Some(processor) = &self.processor {
            processor.start().await?;
            started.push(processor.as_ref());
        }

        self.transcoder.inherit_info(&self.ingest.stream_info());
        self.transcoder.start().await?;
        started.push(self.transcoder.as_ref());

        self.distributor.start().await?;
        started.push(self.distributor.as_ref());
        Ok(())
    }

    fn stages(&self) -> Vec<&dyn Lifecycle> {
        let mut stages: Vec<&dyn Lifecycle> = vec![self.ingest.as_ref()];
        if let Some(processor) = &self.processor {
            stages.push(processor.as_ref());
        }
        stages.push(self.transcoder.as_ref());
        stages.push(self.distributor.as_ref());
        stages
    }
}

/// Stop stages last-started first, attempting all of them. Returns the first
/// error seen.
async fn stop_in_reverse(stages: &[&dyn Lifecycle]) -> Result<()> {
    let mut first_error = None;
    for stage in stages.iter().rev() {
        if let Err(e) = stage.stop().await {
            warn!("pipeline stage failed to stop: {}", e);
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[async_trait]
impl Lifecycle for PipelineManager {
    async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let mut started = Vec::new();
        if let Err(e) = self.start_stages(&mut started).await {
            warn!(started = started.len(), "pipeline start failed, unwinding: {}", e);
            let _ = stop_in_reverse(&started).await;
            return Err(e);
        }

        self.running.store(true, Ordering::SeqCst);
        info!(outputs = ?self.output_urls(), "pipeline running");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let result = stop_in_reverse(&self.stages()).await;
        info!("pipeline stopped");
        result
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
