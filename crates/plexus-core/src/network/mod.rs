//! Network layer: HTTP client and the keyed download manager.

pub mod client;
pub mod download;

pub use client::HttpClient;
pub use download::{
    DownloadHandle, DownloadManager, DownloadOutcome, DownloadRequest, DownloadSnapshot,
    DownloadSource, DownloadState, HttpSource, SourceResponse,
};
