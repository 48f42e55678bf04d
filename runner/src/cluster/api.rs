/*
 * Copyright 2024 Oxide Computer Company
 */

use std::path::Path;
use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{ClientBuilder, StatusCode};
use runomat_types::config::ConfigFileCluster;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;

use super::model::{EventKind, Pod, PodEvent};

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("cluster request failed: {0}")]
    Api(String),
    /**
     * The watch connection was lost or reported an error.  The pod itself
     * is unaffected, and a new watch may be established.
     */
    #[error("watch interrupted: {0}")]
    Watch(String),
}

pub type WatchStream =
    Pin<Box<dyn Stream<Item = Result<PodEvent, ClusterError>> + Send>>;
pub type LogStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, ClusterError>> + Send>>;

/**
 * The operations we need from the cluster orchestrator.
 */
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_pod(
        &self,
        namespace: &str,
        manifest: &serde_json::Value,
    ) -> Result<(), ClusterError>;

    /**
     * Delete a pod.  If the pod does not exist, returns NotFound.
     */
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError>;

    /**
     * Watch status changes for one pod.  The stream ends cleanly only when
     * the pod has been deleted; any other interruption is reported as a
     * Watch error.
     */
    async fn watch_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WatchStream, ClusterError>;

    /**
     * Follow the output of the pod's container until it exits.
     */
    async fn follow_log(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<LogStream, ClusterError>;
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: serde_json::Value,
}

/**
 * Interpret one line of a watch response.  Returns None for events that
 * carry nothing of interest.
 */
fn parse_event(line: &str) -> Result<Option<PodEvent>, ClusterError> {
    let raw: RawEvent = serde_json::from_str(line)
        .map_err(|e| ClusterError::Watch(format!("bad watch event: {e}")))?;

    let kind = raw.kind.parse::<EventKind>().map_err(|_| {
        ClusterError::Watch(format!("unknown watch event type {:?}", raw.kind))
    })?;

    match kind {
        EventKind::Bookmark => Ok(None),
        EventKind::Error => {
            /*
             * The object is a Status, which describes the failure.  A
             * "resource version too old" error lands here.
             */
            let msg = raw
                .object
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            Err(ClusterError::Watch(msg.to_string()))
        }
        kind => {
            let pod: Pod = serde_json::from_value(raw.object).map_err(|e| {
                ClusterError::Watch(format!("bad pod object: {e}"))
            })?;
            Ok(Some(PodEvent::new(kind, pod)))
        }
    }
}

/**
 * Convert a newline-delimited stream of watch events into a stream of pod
 * events.  The stream is terminated after a DELETED event, or after the
 * first error.
 */
fn watch_events<S>(lines: S) -> WatchStream
where
    S: Stream<Item = std::io::Result<String>> + Send + Unpin + 'static,
{
    Box::pin(futures::stream::unfold(Some(lines), |lines| async move {
        let mut lines = lines?;

        loop {
            let item = match lines.next().await {
                None => Err(ClusterError::Watch("watch ended".into())),
                Some(Err(e)) => Err(ClusterError::Watch(e.to_string())),
                Some(Ok(l)) if l.trim().is_empty() => continue,
                Some(Ok(l)) => match parse_event(&l) {
                    Ok(None) => continue,
                    Ok(Some(ev)) => Ok(ev),
                    Err(e) => Err(e),
                },
            };

            let more = matches!(&item, Ok(ev) if ev.kind != EventKind::Deleted);
            return Some((item, more.then_some(lines)));
        }
    }))
}

/**
 * A client for the Kubernetes REST API, authenticated with a service account
 * token.
 */
pub struct KubeClient {
    client: reqwest::Client,
    url: String,
}

fn bearer_client(token: &str, ca: Option<&Path>) -> Result<reqwest::Client> {
    let mut dh = HeaderMap::new();
    dh.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token))?,
    );

    let mut cb = ClientBuilder::new()
        .connect_timeout(std::time::Duration::from_secs(15))
        .default_headers(dh);

    if let Some(ca) = ca {
        let pem = std::fs::read(ca)
            .with_context(|| format!("reading CA certificate {ca:?}"))?;
        cb = cb.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
    }

    /*
     * Watch and log requests remain open for as long as the pod runs, so
     * there is no overall request timeout.
     */
    Ok(cb.build()?)
}

async fn api_error(what: &str, res: reqwest::Response) -> ClusterError {
    let status = res.status();
    if status == StatusCode::NOT_FOUND {
        return ClusterError::NotFound(what.to_string());
    }

    let body = res.text().await.unwrap_or_default();
    ClusterError::Api(format!("{what}: {status}: {}", body.trim()))
}

fn request_error(what: &str, e: reqwest::Error) -> ClusterError {
    ClusterError::Api(format!("{what}: {e}"))
}

impl KubeClient {
    pub fn new(config: &ConfigFileCluster) -> Result<KubeClient> {
        let token = match &config.token_file {
            Some(p) => std::fs::read_to_string(p)
                .with_context(|| format!("reading token {p:?}"))?,
            None => String::new(),
        };

        Ok(KubeClient {
            client: bearer_client(token.trim(), config.ca_file.as_deref())?,
            url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    fn pods_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.url, namespace)
    }

    async fn open_stream(
        &self,
        what: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<
        impl Stream<Item = std::io::Result<Bytes>> + Send + Unpin + 'static,
        ClusterError,
    > {
        let res = req.send().await.map_err(|e| request_error(what, e))?;
        if !res.status().is_success() {
            return Err(api_error(what, res).await);
        }

        Ok(Box::pin(res.bytes_stream().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e)
        })))
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn create_pod(
        &self,
        namespace: &str,
        manifest: &serde_json::Value,
    ) -> Result<(), ClusterError> {
        let what = "create pod";
        let res = self
            .client
            .post(self.pods_url(namespace))
            .json(manifest)
            .send()
            .await
            .map_err(|e| request_error(what, e))?;

        if res.status().is_success() {
            Ok(())
        } else {
            Err(api_error(what, res).await)
        }
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        let res = self
            .client
            .delete(format!("{}/{}", self.pods_url(namespace), name))
            .send()
            .await
            .map_err(|e| request_error(name, e))?;

        if res.status().is_success() {
            Ok(())
        } else {
            Err(api_error(name, res).await)
        }
    }

    async fn watch_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WatchStream, ClusterError> {
        let selector = format!("metadata.name={name}");
        let req = self
            .client
            .get(self.pods_url(namespace))
            .query(&[("watch", "true"), ("fieldSelector", selector.as_str())]);

        let body = self.open_stream(name, req).await?;
        let lines = LinesStream::new(StreamReader::new(body).lines());
        Ok(watch_events(lines))
    }

    async fn follow_log(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<LogStream, ClusterError> {
        let req = self
            .client
            .get(format!("{}/{}/log", self.pods_url(namespace), name))
            .query(&[("follow", "true")]);

        let body = self.open_stream(name, req).await?;
        Ok(Box::pin(
            body.map_err(|e| ClusterError::Api(format!("reading log: {e}"))),
        ))
    }
}
