use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::ACCEPT;
use thiserror::Error;

use crate::engine::{FileRegistry, ImageReference};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("could not list instances for series {series_uid}")]
    Listing {
        series_uid: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("could not fetch instance {url}")]
    Fetch {
        url: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesMeta {
    pub series_instance_uid: String,
    pub series_number: u32,
    pub series_description: String,
}

/// Access to the study server. The shipped implementation talks HTTP; tests
/// substitute an in-memory one.
pub trait InstanceService: Send + Sync {
    fn fetch_series(&self, patient_id: &str) -> Result<Vec<SeriesMeta>>;
    fn fetch_instance_list(&self, series_uid: &str) -> Result<Vec<String>>;
    fn fetch_instance(&self, url: &str) -> Result<Vec<u8>>;
}

/// Resolves a server series into an ordered reference list. Instance payloads
/// download in parallel but are reassembled by input index, so the returned
/// order always matches the server's instance order. Nothing is registered
/// unless every instance fetched; a partial series is never observable.
pub fn resolve_series(
    service: &dyn InstanceService,
    registry: &FileRegistry,
    series_uid: &str,
) -> Result<Vec<ImageReference>, ResolveError> {
    let urls = service
        .fetch_instance_list(series_uid)
        .map_err(|source| ResolveError::Listing {
            series_uid: series_uid.to_string(),
            source,
        })?;
    if urls.is_empty() {
        return Ok(Vec::new());
    }

    let mut outputs = (0..urls.len()).map(|_| None::<Result<Vec<u8>>>).collect::<Vec<_>>();
    std::thread::scope(|scope| {
        let mut jobs = Vec::with_capacity(urls.len());
        for (index, url) in urls.iter().enumerate() {
            jobs.push((index, scope.spawn(move || service.fetch_instance(url))));
        }
        for (index, job) in jobs {
            outputs[index] = Some(
                job.join()
                    .unwrap_or_else(|_| bail!("instance download worker panicked")),
            );
        }
    });

    let mut payloads = Vec::with_capacity(urls.len());
    for (index, output) in outputs.into_iter().enumerate() {
        match output {
            Some(Ok(bytes)) => payloads.push(bytes),
            Some(Err(source)) => {
                return Err(ResolveError::Fetch {
                    url: urls[index].clone(),
                    source,
                })
            }
            None => {
                return Err(ResolveError::Fetch {
                    url: urls[index].clone(),
                    source: anyhow::anyhow!("download worker returned no result"),
                })
            }
        }
    }

    let prefix = sanitize_for_file_name(series_uid);
    Ok(payloads
        .into_iter()
        .enumerate()
        .map(|(index, bytes)| registry.register(&format!("{prefix}-{index}.dcm"), bytes))
        .collect())
}

/// Registers an already-read local file bundle under deterministic names.
pub fn register_local_files(
    registry: &FileRegistry,
    prefix: &str,
    payloads: Vec<Vec<u8>>,
) -> Vec<ImageReference> {
    let prefix = sanitize_for_file_name(prefix);
    payloads
        .into_iter()
        .enumerate()
        .map(|(index, bytes)| registry.register(&format!("{prefix}-{index}.dcm"), bytes))
        .collect()
}

pub struct HttpInstanceService {
    client: Client,
    base: String,
}

impl HttpInstanceService {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("Could not initialize HTTP client for the study server")?;
        Ok(Self {
            client,
            base: base_url.trim().trim_end_matches('/').to_string(),
        })
    }
}

impl InstanceService for HttpInstanceService {
    fn fetch_series(&self, patient_id: &str) -> Result<Vec<SeriesMeta>> {
        let url = format!("{}/patients/{patient_id}/series", self.base);
        let json = http_get_text(&self.client, &url, "application/json")
            .with_context(|| format!("Failed fetching series list from {url}"))?;
        parse_series_list(&json)
    }

    fn fetch_instance_list(&self, series_uid: &str) -> Result<Vec<String>> {
        let url = format!("{}/series/{series_uid}/instances", self.base);
        let json = http_get_text(&self.client, &url, "application/json")
            .with_context(|| format!("Failed fetching instance list from {url}"))?;
        parse_instance_urls(&json)
    }

    fn fetch_instance(&self, url: &str) -> Result<Vec<u8>> {
        http_get_bytes(&self.client, url, "application/dicom")
    }
}

fn http_get_text(client: &Client, url: &str, accept: &str) -> Result<String> {
    let bytes = http_get_bytes(client, url, accept)?;
    String::from_utf8(bytes).context("HTTP response was not valid UTF-8")
}

fn http_get_bytes(client: &Client, url: &str, accept: &str) -> Result<Vec<u8>> {
    let response = client
        .get(url)
        .header(ACCEPT, accept)
        .send()
        .with_context(|| format!("HTTP request failed for {url}"))?;
    let status = response.status();
    if !status.is_success() {
        let detail = response
            .text()
            .unwrap_or_else(|_| String::from("unable to read error body"));
        bail!("HTTP {status} for {url}: {detail}");
    }
    response
        .bytes()
        .map(|body| body.to_vec())
        .with_context(|| format!("Could not read response body from {url}"))
}

fn parse_series_list(json: &str) -> Result<Vec<SeriesMeta>> {
    let objects = split_top_level_json_objects(json)
        .with_context(|| "series list JSON parsing failed".to_string())?;
    let mut series = Vec::new();
    for obj in objects {
        let uid = match first_field_string(obj, "seriesInstanceUID") {
            Some(value) if !value.trim().is_empty() => value,
            _ => continue,
        };
        series.push(SeriesMeta {
            series_instance_uid: uid,
            series_number: first_field_string(obj, "seriesNumber")
                .and_then(|value| value.parse::<u32>().ok())
                .unwrap_or(0),
            series_description: first_field_string(obj, "seriesDescription").unwrap_or_default(),
        });
    }
    Ok(series)
}

fn parse_instance_urls(json: &str) -> Result<Vec<String>> {
    let trimmed = json.trim();
    if !trimmed.starts_with('[') {
        bail!("instance list response is not a JSON array");
    }
    let mut urls = Vec::new();
    let mut rest = &trimmed[1..];
    loop {
        let Some(token) = parse_first_json_token(rest) else {
            break;
        };
        if let Some(url) = first_token_to_string(token) {
            urls.push(url);
        }
        let consumed = rest.find(token).unwrap_or(0) + token.len();
        let tail = &rest[consumed..];
        match tail.find(',') {
            Some(comma) => rest = &tail[comma + 1..],
            None => break,
        }
    }
    Ok(urls)
}

fn split_top_level_json_objects(input: &str) -> Result<Vec<&str>> {
    let mut objects = Vec::new();
    let mut depth = 0usize;
    let mut object_start = None::<usize>;
    let mut in_string = false;
    let mut escaped = false;

    for (index, ch) in input.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
                continue;
            }
            if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    object_start = Some(index);
                }
                depth += 1;
            }
            '}' => {
                if depth == 0 {
                    bail!("Unexpected closing brace in JSON");
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(start) = object_start.take() {
                        objects.push(&input[start..=index]);
                    }
                }
            }
            _ => {}
        }
    }

    if depth != 0 || in_string {
        bail!("Unbalanced JSON while parsing series list");
    }
    Ok(objects)
}

fn first_field_string(object: &str, field: &str) -> Option<String> {
    let needle = format!("\"{field}\"");
    let field_pos = object.find(&needle)?;
    let tail = &object[field_pos + needle.len()..];
    let colon = tail.find(':')?;
    let token = parse_first_json_token(&tail[colon + 1..])?;
    first_token_to_string(token)
}

fn parse_first_json_token(value: &str) -> Option<&str> {
    let bytes = value.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= bytes.len() || bytes[i] == b']' {
        return None;
    }

    if bytes[i] == b'"' {
        let start = i;
        i += 1;
        let mut escaped = false;
        while i < bytes.len() {
            let b = bytes[i];
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                return value.get(start..=i);
            }
            i += 1;
        }
        return None;
    }

    let start = i;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b',' || b == b']' || b == b'}' {
            return value.get(start..i).map(str::trim);
        }
        i += 1;
    }
    value.get(start..i).map(str::trim)
}

fn first_token_to_string(token: &str) -> Option<String> {
    let token = token.trim();
    if token.is_empty() || token == "null" {
        return None;
    }
    if token.starts_with('"') && token.ends_with('"') && token.len() >= 2 {
        let inner = &token[1..token.len() - 1];
        return Some(unescape_json_string(inner));
    }
    Some(token.to_string())
}

fn unescape_json_string(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        let Some(next) = chars.next() else {
            break;
        };
        match next {
            '"' => output.push('"'),
            '\\' => output.push('\\'),
            '/' => output.push('/'),
            'b' => output.push('\u{0008}'),
            'f' => output.push('\u{000C}'),
            'n' => output.push('\n'),
            'r' => output.push('\r'),
            't' => output.push('\t'),
            'u' => {
                let hex = chars.by_ref().take(4).collect::<String>();
                if hex.len() == 4 {
                    if let Ok(codepoint) = u16::from_str_radix(&hex, 16) {
                        if let Some(decoded) = char::from_u32(codepoint as u32) {
                            output.push(decoded);
                        }
                    }
                }
            }
            other => output.push(other),
        }
    }
    output
}

fn sanitize_for_file_name(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    struct InMemoryService {
        series: Vec<SeriesMeta>,
        instance_urls: HashMap<String, Vec<String>>,
        payloads: HashMap<String, Vec<u8>>,
        delays: HashMap<String, Duration>,
        fail_urls: Vec<String>,
        fail_listing: bool,
    }

    impl InMemoryService {
        fn new() -> Self {
            Self {
                series: Vec::new(),
                instance_urls: HashMap::new(),
                payloads: HashMap::new(),
                delays: HashMap::new(),
                fail_urls: Vec::new(),
                fail_listing: false,
            }
        }

        fn with_series(mut self, uid: &str, urls: &[&str]) -> Self {
            self.instance_urls
                .insert(uid.to_string(), urls.iter().map(|url| url.to_string()).collect());
            for (index, url) in urls.iter().enumerate() {
                self.payloads
                    .insert(url.to_string(), format!("payload-{index}").into_bytes());
            }
            self
        }
    }

    impl InstanceService for InMemoryService {
        fn fetch_series(&self, _patient_id: &str) -> Result<Vec<SeriesMeta>> {
            Ok(self.series.clone())
        }

        fn fetch_instance_list(&self, series_uid: &str) -> Result<Vec<String>> {
            if self.fail_listing {
                bail!("listing endpoint unavailable");
            }
            self.instance_urls
                .get(series_uid)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown series {series_uid}"))
        }

        fn fetch_instance(&self, url: &str) -> Result<Vec<u8>> {
            if let Some(delay) = self.delays.get(url) {
                std::thread::sleep(*delay);
            }
            if self.fail_urls.iter().any(|failing| failing == url) {
                bail!("simulated transfer failure for {url}");
            }
            self.payloads
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown url {url}"))
        }
    }

    #[test]
    fn resolved_order_matches_listing_order_despite_completion_order() {
        let mut service =
            InMemoryService::new().with_series("1.2.3", &["http://s/i0", "http://s/i1", "http://s/i2"]);
        // the first instance finishes last
        service
            .delays
            .insert("http://s/i0".to_string(), Duration::from_millis(40));
        service
            .delays
            .insert("http://s/i1".to_string(), Duration::from_millis(10));

        let registry = FileRegistry::new();
        let references =
            resolve_series(&service, &registry, "1.2.3").expect("resolution should succeed");

        assert_eq!(references.len(), 3);
        for (index, reference) in references.iter().enumerate() {
            let bytes = registry.bytes(reference).expect("registered payload");
            assert_eq!(bytes.as_ref(), format!("payload-{index}").as_bytes());
            assert_eq!(
                registry.file_name(reference).as_deref(),
                Some(format!("1.2.3-{index}.dcm").as_str())
            );
        }
    }

    #[test]
    fn any_failed_instance_fails_the_whole_series() {
        let mut service =
            InMemoryService::new().with_series("1.2.3", &["http://s/i0", "http://s/i1"]);
        service.fail_urls.push("http://s/i1".to_string());

        let registry = FileRegistry::new();
        let error = resolve_series(&service, &registry, "1.2.3")
            .expect_err("resolution should fail");

        assert!(matches!(error, ResolveError::Fetch { ref url, .. } if url == "http://s/i1"));
        // all-or-nothing: nothing leaked into the registry
        assert!(registry.is_empty());
    }

    #[test]
    fn listing_failure_is_typed_as_listing() {
        let mut service = InMemoryService::new();
        service.fail_listing = true;

        let registry = FileRegistry::new();
        let error = resolve_series(&service, &registry, "1.2.3")
            .expect_err("resolution should fail");
        assert!(matches!(error, ResolveError::Listing { ref series_uid, .. } if series_uid == "1.2.3"));
    }

    #[test]
    fn empty_instance_list_resolves_to_nothing() {
        let service = InMemoryService::new().with_series("1.2.3", &[]);
        let registry = FileRegistry::new();
        let references =
            resolve_series(&service, &registry, "1.2.3").expect("empty series should resolve");
        assert!(references.is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn local_files_register_in_input_order() {
        let registry = FileRegistry::new();
        let references = register_local_files(
            &registry,
            "study one",
            vec![vec![1u8], vec![2u8], vec![3u8]],
        );
        assert_eq!(references.len(), 3);
        assert_eq!(
            registry.file_name(&references[0]).as_deref(),
            Some("study_one-0.dcm")
        );
        assert_eq!(registry.bytes(&references[2]).as_deref(), Some(&[3u8][..]));
    }

    #[test]
    fn parse_series_list_reads_expected_fields() {
        let json = r#"[
            {"seriesInstanceUID":"1.2.3","seriesNumber":2,"seriesDescription":"AX T1"},
            {"seriesInstanceUID":"4.5.6","seriesNumber":"7","seriesDescription":"SAG T2"},
            {"seriesDescription":"missing uid, skipped"}
        ]"#;
        let series = parse_series_list(json).expect("should parse");
        assert_eq!(
            series,
            vec![
                SeriesMeta {
                    series_instance_uid: "1.2.3".to_string(),
                    series_number: 2,
                    series_description: "AX T1".to_string(),
                },
                SeriesMeta {
                    series_instance_uid: "4.5.6".to_string(),
                    series_number: 7,
                    series_description: "SAG T2".to_string(),
                },
            ]
        );
    }

    #[test]
    fn parse_instance_urls_reads_string_array() {
        let json = r#"[ "http://s/i0", "http://s/i1" ]"#;
        let urls = parse_instance_urls(json).expect("should parse");
        assert_eq!(urls, vec!["http://s/i0", "http://s/i1"]);
        assert!(parse_instance_urls("[]").expect("empty array").is_empty());
        assert!(parse_instance_urls("{\"not\":\"an array\"}").is_err());
    }
}
