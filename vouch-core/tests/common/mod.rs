// Each integration test compiles as a separate binary that includes this module via `mod common;`.
// Not every test binary uses every helper, so Rust emits spurious dead_code warnings.
#![allow(dead_code)]
//! Shared fixtures for kernel integration tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vouch_core::{
    Fetcher, IdentityFileContent, JsonFileParser, Kernel, QueuedFile, TrustListEntry,
};
use vouch_model::{Config, IdentityId, MockClock, RequestUri};

/// Fetcher double recording what the scheduler asks for.
#[derive(Default)]
pub struct RecordingFetcher {
    pub started: Mutex<Vec<RequestUri>>,
    pub cancelled: Mutex<Vec<IdentityId>>,
}

impl Fetcher for RecordingFetcher {
    fn start_fetch(&self, uri: &RequestUri) {
        self.started.lock().unwrap().push(*uri);
    }

    fn cancel_fetch(&self, id: &IdentityId) {
        self.cancelled.lock().unwrap().push(*id);
    }
}

pub struct TestKernel {
    pub kernel: Arc<Kernel>,
    pub fetcher: Arc<RecordingFetcher>,
    pub clock: MockClock,
}

pub fn test_kernel() -> TestKernel {
    test_kernel_with_config(Config {
        import_delay: Duration::from_millis(50),
        subscription_delay: Duration::from_millis(50),
        ..Config::default()
    })
}

pub fn test_kernel_with_config(config: Config) -> TestKernel {
    let clock = MockClock::new(1_000_000);
    let fetcher = Arc::new(RecordingFetcher::default());
    let kernel = Kernel::new(
        config,
        fetcher.clone(),
        Arc::new(JsonFileParser),
        Arc::new(clock.clone()),
    );
    TestKernel {
        kernel,
        fetcher,
        clock,
    }
}

pub fn uri(seed: u8, edition: u64) -> RequestUri {
    RequestUri::new(IdentityId([seed; 32]), edition)
}

/// Builds a JSON identity document.
pub fn identity_file(
    nickname: Option<&str>,
    publishes_trust_list: bool,
    trusts: &[(RequestUri, i8, &str)],
) -> Vec<u8> {
    let content = IdentityFileContent {
        nickname: nickname.map(str::to_owned),
        publishes_trust_list,
        contexts: Vec::new(),
        properties: BTreeMap::new(),
        trust_list: trusts
            .iter()
            .map(|(trustee, value, comment)| TrustListEntry {
                trustee: *trustee,
                value: *value,
                comment: (*comment).to_owned(),
            })
            .collect(),
    };
    serde_json::to_vec(&content).expect("serializable")
}

/// Enqueues a fetched document for `uri` as the network layer would.
pub fn deliver(kernel: &Kernel, uri: RequestUri, payload: Vec<u8>) {
    kernel.import_queue().add(QueuedFile { uri, payload });
}
