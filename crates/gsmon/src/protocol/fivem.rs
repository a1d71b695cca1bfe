//! FiveM (Cfx.re) servers, queried through their HTTP info endpoints.

use std::net::SocketAddr;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_with::{DisplayFromStr, PickFirst, serde_as};

use super::{Protocol, Reply, non_empty};
use crate::error::{QueryFailure, Result};
use crate::resolver::{Endpoint, SrvService};

static COLOUR_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\^\d").expect("colour code pattern is valid"));

pub struct FivemProtocol {
    http: reqwest::Client,
}

impl FivemProtocol {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        // Plenty of servers run with self-signed certificates.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()
            .context("Failed to build FiveM HTTP client")?;
        Ok(Self { http })
    }

    async fn get<T: DeserializeOwned>(&self, addr: SocketAddr, file: &str) -> Result<T> {
        let url = format!("https://{addr}/{file}");
        let cache_buster = chrono::Utc::now().timestamp();
        let response = self
            .http
            .get(&url)
            .query(&[("v", cache_buster)])
            .send()
            .await
            .map_err(http_failure)?
            .error_for_status()
            .map_err(http_failure)?;
        let body = response.bytes().await.map_err(http_failure)?;
        serde_json::from_slice(&body).map_err(|_| {
            QueryFailure::malformed("Unexpected response format; did server shutdown?")
        })
    }
}

fn http_failure(err: reqwest::Error) -> QueryFailure {
    if err.is_timeout() {
        QueryFailure::Timeout
    } else if let Some(status) = err.status() {
        QueryFailure::malformed(format!("Server responded with {status}"))
    } else if err.is_connect() {
        QueryFailure::unreachable("Failed to connect to server")
    } else {
        QueryFailure::unreachable(err)
    }
}

#[async_trait]
impl Protocol for FivemProtocol {
    fn srv(&self) -> Option<SrvService> {
        Some(SrvService::new("_cfx._udp"))
    }

    async fn probe(&self, endpoint: &Endpoint, _extra: &str, timeout: Duration) -> Result<Reply> {
        let fetch = async {
            let dynamic: Dynamic = self.get(endpoint.addr, "dynamic.json").await?;
            let info: Info = self.get(endpoint.addr, "info.json").await?;
            let players: Vec<Player> = self.get(endpoint.addr, "players.json").await?;
            Ok::<_, QueryFailure>(build_reply(dynamic, info, players))
        };
        tokio::time::timeout(timeout, fetch).await?
    }
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Dynamic {
    hostname: String,
    gametype: String,
    mapname: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    clients: u32,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    sv_maxclients: u32,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    iv: u64,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InfoVars {
    #[serde(rename = "sv_maxClients")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    sv_max_clients: u32,
    #[serde(rename = "sv_projectName")]
    sv_project_name: String,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Info {
    icon: Option<String>,
    vars: InfoVars,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    version: u64,
}

#[derive(Debug, Deserialize)]
struct Player {
    #[serde(default)]
    name: String,
}

fn build_reply(dynamic: Dynamic, info: Info, players: Vec<Player>) -> Reply {
    let raw_title = if dynamic.hostname.trim().is_empty() {
        &info.vars.sv_project_name
    } else {
        &dynamic.hostname
    };
    let title = non_empty(COLOUR_CODE.replace_all(raw_title, ""));

    let max_players = if dynamic.sv_maxclients > 0 {
        dynamic.sv_maxclients
    } else {
        info.vars.sv_max_clients
    };
    let version = [dynamic.iv, info.version].into_iter().find(|v| *v > 0);

    Reply {
        title,
        thumbnail: info.icon.and_then(|icon| STANDARD.decode(icon).ok()),
        game: non_empty(dynamic.gametype),
        map: non_empty(dynamic.mapname),
        version: version.map(|v| v.to_string()),
        max_players: Some(max_players),
        num_players: Some(dynamic.clients),
        players: players.into_iter().filter_map(|p| non_empty(p.name)).collect(),
        ..Reply::default()
    }
}
