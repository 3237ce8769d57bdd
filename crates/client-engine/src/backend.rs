//! C7: Task Client — HTTP fetch of Orders, content-addressed download of
//! network blobs and seed SGFs, and multipart upload of results.
//!
//! Grounded on the teacher's `crates/client-engine/src/backend.rs` for the
//! reqwest-based request/response/error shape (a DTO struct per endpoint, a
//! free `async fn` per operation, `anyhow::bail!` on non-success status).
//! The wire contract itself (field names, JSON shape, option-flag schema) is
//! `autogtp/Management.cpp`'s `getWorkInternal`/`uploadResult`/`uploadData`/
//! `getOptionsString`/`fetchNetwork`, reimplemented against a real async HTTP
//! client instead of the source's subprocess-curl invocation.

use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::order::{Order, OrderKind};

/// Errors specific to the backend contract (beyond generic transport
/// failures, which are reported via `anyhow::Error`).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The server requires a client version newer than this build.
    #[error("server requires client version {required}, this build is {actual}")]
    ClientTooOld { required: u32, actual: u32 },
    /// A downloaded network's SHA-256 did not match the server-supplied hash.
    #[error("network hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

#[derive(Debug, Deserialize)]
struct TaskResponseDto {
    cmd: String,
    #[serde(default)]
    required_client_version: Option<u32>,
    #[serde(default)]
    leelaz_version: Option<String>,
    #[serde(default)]
    random_seed: Option<String>,
    #[serde(default)]
    options_hash: Option<String>,
    #[serde(default)]
    options: serde_json::Value,
    #[serde(default)]
    white_options: Option<serde_json::Value>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    hash_gzip_hash: Option<String>,
    #[serde(default)]
    black_hash: Option<String>,
    #[serde(default)]
    black_hash_gzip_hash: Option<String>,
    #[serde(default)]
    white_hash: Option<String>,
    #[serde(default)]
    white_hash_gzip_hash: Option<String>,
    #[serde(default)]
    hash_sgf_hash: Option<String>,
    #[serde(default)]
    moves_count: Option<u32>,
    #[serde(default)]
    gtp_commands: Vec<String>,
    #[serde(default)]
    white_gtp_commands: Vec<String>,
    #[serde(default)]
    minutes: Option<String>,
}

/// Fetches one task and builds its [`Order`], ensuring every referenced
/// network is present and hash-verified on disk and downloading a seed SGF
/// if one is referenced.
pub async fn fetch_order(
    http: &reqwest::Client,
    backend: &reqwest::Url,
    client_version: u32,
    engine_version: Option<&str>,
    networks_dir: &Path,
) -> anyhow::Result<Order> {
    let mut path = format!("get-task/{client_version}");
    if let Some(v) = engine_version {
        path.push('/');
        path.push_str(v);
    }
    let url = backend.join(&path)?;
    let res = http.get(url).send().await?;
    if !res.status().is_success() {
        anyhow::bail!("http {}: get-task failed", res.status());
    }
    let dto: TaskResponseDto = res.json().await?;

    if let Some(required) = dto.required_client_version {
        if required > client_version {
            return Err(BackendError::ClientTooOld {
                required,
                actual: client_version,
            }
            .into());
        }
    }

    let mut order = match dto.cmd.as_str() {
        "wait" => {
            let mut order = Order::new(OrderKind::Wait, Default::default());
            order.add("minutes", dto.minutes.unwrap_or_else(|| "1".to_string()));
            order
        }
        "selfplay" => {
            let hash = dto.hash.clone().unwrap_or_default();
            let gzip_hash = dto.hash_gzip_hash.clone().unwrap_or_default();
            fetch_network(http, backend, &hash, &gzip_hash, networks_dir).await?;

            let mut order = Order::new(OrderKind::Production, Default::default());
            order.add("network", hash);
            order.add(
                "options",
                build_option_string(&dto.options, dto.random_seed.as_deref()),
            );
            order.add("gtpCommands", dto.gtp_commands.join(","));
            order.add("optHash", dto.options_hash.clone().unwrap_or_default());
            if let (Some(sgf), Some(moves)) = (&dto.hash_sgf_hash, dto.moves_count) {
                let sgf_path = fetch_seed_sgf(http, backend, sgf, networks_dir).await?;
                order.add("sgf", sgf_path.to_string_lossy().to_string());
                order.add("moves", moves.to_string());
            }
            order
        }
        "match" => {
            let black_hash = dto.black_hash.clone().unwrap_or_default();
            let black_gzip = dto.black_hash_gzip_hash.clone().unwrap_or_default();
            fetch_network(http, backend, &black_hash, &black_gzip, networks_dir).await?;
            let white_hash = dto.white_hash.clone().unwrap_or_default();
            let white_gzip = dto.white_hash_gzip_hash.clone().unwrap_or_default();
            fetch_network(http, backend, &white_hash, &white_gzip, networks_dir).await?;

            let mut order = Order::new(OrderKind::Validation, Default::default());
            order.add("firstNet", black_hash);
            order.add("secondNet", white_hash);
            order.add(
                "options",
                build_option_string(&dto.options, dto.random_seed.as_deref()),
            );
            order.add(
                "optionsSecond",
                build_option_string(
                    dto.white_options.as_ref().unwrap_or(&dto.options),
                    dto.random_seed.as_deref(),
                ),
            );
            order.add("gtpCommands", dto.gtp_commands.join(","));
            order.add("gtpCommandsSecond", dto.white_gtp_commands.join(","));
            order.add("optHash", dto.options_hash.clone().unwrap_or_default());
            if let (Some(sgf), Some(moves)) = (&dto.hash_sgf_hash, dto.moves_count) {
                let sgf_path = fetch_seed_sgf(http, backend, sgf, networks_dir).await?;
                order.add("sgf", sgf_path.to_string_lossy().to_string());
                order.add("moves", moves.to_string());
            }
            order
        }
        other => anyhow::bail!("unrecognised task cmd: {other}"),
    };
    order.add(
        "leelazVer",
        dto.leelaz_version.unwrap_or_else(|| "0.0.0".to_string()),
    );
    order.add(
        "rndSeed",
        dto.random_seed.unwrap_or_else(|| "0".to_string()),
    );
    Ok(order)
}

/// Downloads `networks/<hash>.gz` if not already present with a matching
/// SHA-256; deletes and retries once if a stale file's hash no longer
/// matches.
pub async fn fetch_network(
    http: &reqwest::Client,
    backend: &reqwest::Url,
    hash: &str,
    expected_gzip_sha256: &str,
    networks_dir: &Path,
) -> anyhow::Result<()> {
    if hash.is_empty() {
        return Ok(());
    }
    let path = networks_dir.join(format!("{hash}.gz"));
    if path.exists() {
        let bytes = tokio::fs::read(&path).await?;
        if sha256_hex(&bytes) == expected_gzip_sha256 {
            return Ok(());
        }
        tokio::fs::remove_file(&path).await?;
    }

    let url = backend.join(&format!("networks/{hash}.gz"))?;
    let res = http.get(url).send().await?;
    if !res.status().is_success() {
        anyhow::bail!("http {}: network download failed", res.status());
    }
    let bytes = res.bytes().await?;
    let actual = sha256_hex(&bytes);
    if !expected_gzip_sha256.is_empty() && actual != expected_gzip_sha256 {
        return Err(BackendError::HashMismatch {
            expected: expected_gzip_sha256.to_string(),
            actual,
        }
        .into());
    }
    tokio::fs::create_dir_all(networks_dir).await?;
    tokio::fs::write(&path, &bytes).await?;
    Ok(())
}

async fn fetch_seed_sgf(
    http: &reqwest::Client,
    backend: &reqwest::Url,
    hash: &str,
    dir: &Path,
) -> anyhow::Result<std::path::PathBuf> {
    let basename = uuid::Uuid::new_v4().simple().to_string();
    let path = dir.join(format!("{basename}.sgf"));
    let url = backend.join(&format!("view/{hash}.sgf"))?;
    let res = http.get(url).send().await?;
    if !res.status().is_success() {
        anyhow::bail!("http {}: seed sgf download failed", res.status());
    }
    let text = res.text().await?;
    tokio::fs::write(&path, text).await?;
    Ok(path)
}

/// Uploads a self-play result via multipart form to `/submit`.
#[allow(clippy::too_many_arguments)]
pub async fn submit_selfplay(
    http: &reqwest::Client,
    backend: &reqwest::Url,
    network_hash: &str,
    client_version: u32,
    options_hash: &str,
    moves: u32,
    winner_color: &str,
    random_seed: &str,
    sgf_gz: Vec<u8>,
    training_gz: Vec<u8>,
) -> anyhow::Result<()> {
    let form = reqwest::multipart::Form::new()
        .text("networkhash", network_hash.to_string())
        .text("clientversion", client_version.to_string())
        .text("options_hash", options_hash.to_string())
        .text("movescount", moves.to_string())
        .text("winnercolor", winner_color.to_string())
        .text("random_seed", random_seed.to_string())
        .part(
            "sgf",
            reqwest::multipart::Part::bytes(sgf_gz).file_name("game.sgf.gz"),
        )
        .part(
            "trainingdata",
            reqwest::multipart::Part::bytes(training_gz).file_name("training.txt.0.gz"),
        );

    let url = backend.join("submit")?;
    let res = http.post(url).multipart(form).send().await?;
    if !res.status().is_success() {
        anyhow::bail!("http {}: submit failed", res.status());
    }
    Ok(())
}

/// Uploads a match result via multipart form to `/submit-match`.
#[allow(clippy::too_many_arguments)]
pub async fn submit_match(
    http: &reqwest::Client,
    backend: &reqwest::Url,
    winner_hash: &str,
    loser_hash: &str,
    client_version: u32,
    winner_color: &str,
    moves: u32,
    score: &str,
    options_hash: &str,
    random_seed: &str,
    sgf_gz: Vec<u8>,
) -> anyhow::Result<()> {
    let form = reqwest::multipart::Form::new()
        .text("winnerhash", winner_hash.to_string())
        .text("loserhash", loser_hash.to_string())
        .text("clientversion", client_version.to_string())
        .text("winnercolor", winner_color.to_string())
        .text("movescount", moves.to_string())
        .text("score", score.to_string())
        .text("options_hash", options_hash.to_string())
        .text("random_seed", random_seed.to_string())
        .part(
            "sgf",
            reqwest::multipart::Part::bytes(sgf_gz).file_name("game.sgf.gz"),
        );

    let url = backend.join("submit-match")?;
    let res = http.post(url).multipart(form).send().await?;
    if !res.status().is_success() {
        anyhow::bail!("http {}: submit-match failed", res.status());
    }
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Flattens the options JSON sub-object to a command-line flag string using
/// the fixed schema from SPEC_FULL.md §4.7, always appending `--noponder`
/// and, when a non-zero seed is present, `-s <seed>`.
pub fn build_option_string(options: &serde_json::Value, seed: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(v) = option_str(options, "playouts") {
        out.push_str(&format!("-p {v} "));
    }
    if let Some(v) = option_str(options, "visits") {
        out.push_str(&format!("-v {v} "));
    }
    out.push_str(&format!("-r {} ", option_str_or(options, "resignation_percent", "1")));
    out.push_str(&format!("-m {} ", option_str_or(options, "randomcnt", "30")));
    out.push_str(&format!("-t {} ", option_str_or(options, "threads", "6")));
    out.push_str(&format!(
        "--batchsize {} ",
        option_str_or(options, "batchsize", "5")
    ));
    if option_bool_or(options, "dumbpass", true) {
        out.push_str("-d ");
    }
    if option_bool_or(options, "noise", true) {
        out.push_str("-n ");
    }
    out.push_str("--noponder ");
    if let Some(seed) = seed {
        if seed != "0" {
            out.push_str(&format!("-s {seed} "));
        }
    }
    out
}

fn option_str(options: &serde_json::Value, key: &str) -> Option<String> {
    options.get(key).map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn option_str_or(options: &serde_json::Value, key: &str, default: &str) -> String {
    option_str(options, key).unwrap_or_else(|| default.to_string())
}

fn option_bool_or(options: &serde_json::Value, key: &str, default: bool) -> bool {
    options.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_string_uses_defaults() {
        let opts = serde_json::json!({});
        let s = build_option_string(&opts, None);
        assert!(s.contains("-r 1 "));
        assert!(s.contains("-m 30 "));
        assert!(s.contains("-t 6 "));
        assert!(s.contains("--batchsize 5 "));
        assert!(s.contains("-d "));
        assert!(s.contains("-n "));
        assert!(s.contains("--noponder"));
        assert!(!s.contains("-s "));
    }

    #[test]
    fn option_string_appends_seed_when_nonzero() {
        let opts = serde_json::json!({});
        let s = build_option_string(&opts, Some("42"));
        assert!(s.contains("-s 42"));
        let s0 = build_option_string(&opts, Some("0"));
        assert!(!s0.contains("-s "));
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
