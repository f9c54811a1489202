use std::path::PathBuf;

/// What the viewer opens on startup. Parsed once from the command line or a
/// `quadra://` URI and consumed exactly once by the viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerPayload {
    LocalPaths(Vec<PathBuf>),
    LocalGroups { groups: Vec<Vec<PathBuf>> },
    Study {
        base_url: String,
        patient_id: String,
        series_uid: Option<String>,
    },
}

pub fn parse_payload_from_args(args: &[String]) -> Result<Option<ViewerPayload>, String> {
    if args.is_empty() {
        return Ok(None);
    }

    if args.len() == 1 && is_quadra_uri(&args[0]) {
        return parse_quadra_uri(&args[0]).map(Some);
    }

    if args[0] == "--open" {
        if args.len() == 1 {
            return Err("Missing file path(s) after --open.".to_string());
        }
        return Ok(Some(ViewerPayload::LocalPaths(
            args[1..].iter().map(PathBuf::from).collect(),
        )));
    }

    Ok(Some(ViewerPayload::LocalPaths(
        args.iter().map(PathBuf::from).collect(),
    )))
}

pub fn parse_quadra_uri(uri: &str) -> Result<ViewerPayload, String> {
    let rest = strip_quadra_scheme(uri).ok_or_else(|| "URL must start with quadra://".to_string())?;

    let (location, query) = split_location_and_query(rest);
    let mut raw_paths = Vec::new();
    let mut grouped_paths = Vec::<Vec<String>>::new();
    let mut base_url = None::<String>;
    let mut patient_id = None::<String>;
    let mut series_uid = None::<String>;

    if let Some(path_from_location) = parse_location_path(location)? {
        raw_paths.push(path_from_location);
    }

    if let Some(query_string) = query {
        for pair in query_string.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = key.trim().to_ascii_lowercase();
            let decoded_value = percent_decode(value)?;
            match key.as_str() {
                "path" | "file" => {
                    if !decoded_value.trim().is_empty() {
                        raw_paths.push(decoded_value);
                    }
                }
                "paths" | "files" => {
                    for path in split_path_list(&decoded_value) {
                        if !path.trim().is_empty() {
                            raw_paths.push(path.to_string());
                        }
                    }
                }
                "group" => {
                    let group = split_path_list(&decoded_value)
                        .into_iter()
                        .filter(|path| !path.trim().is_empty())
                        .map(|path| path.to_string())
                        .collect::<Vec<_>>();
                    if !group.is_empty() {
                        grouped_paths.push(group);
                    }
                }
                "groups" => {
                    for group in decoded_value.split(';') {
                        let grouped = split_path_list(group)
                            .into_iter()
                            .filter(|path| !path.trim().is_empty())
                            .map(|path| path.to_string())
                            .collect::<Vec<_>>();
                        if !grouped.is_empty() {
                            grouped_paths.push(grouped);
                        }
                    }
                }
                "server" | "base_url" | "server_url" => {
                    let trimmed = decoded_value.trim().trim_end_matches('/');
                    if !trimmed.is_empty() {
                        base_url = Some(trimmed.to_string());
                    }
                }
                "patient" | "patient_id" | "patientid" => {
                    if !decoded_value.trim().is_empty() {
                        patient_id = Some(decoded_value.trim().to_string());
                    }
                }
                "series" | "seriesuid" | "seriesinstanceuid" | "series_instance_uid" => {
                    if !decoded_value.trim().is_empty() {
                        series_uid = Some(decoded_value.trim().to_string());
                    }
                }
                _ => {}
            }
        }
    }

    if !grouped_paths.is_empty() {
        if !raw_paths.is_empty() {
            return Err(
                "Cannot mix grouped launch (group=...) with path=/paths= parameters.".to_string(),
            );
        }
        if base_url.is_some() {
            return Err("Cannot mix grouped local launch (group=...) with server=.".to_string());
        }
        let groups = grouped_paths
            .into_iter()
            .map(|group| group.into_iter().map(PathBuf::from).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        return Ok(ViewerPayload::LocalGroups { groups });
    }

    if let Some(base_url) = base_url {
        if !raw_paths.is_empty() {
            return Err("Cannot mix server= with path=/paths= parameters.".to_string());
        }
        let Some(patient_id) = patient_id else {
            return Err("Study launch requires 'patient' (patient identifier).".to_string());
        };
        return Ok(ViewerPayload::Study {
            base_url,
            patient_id,
            series_uid,
        });
    }

    if patient_id.is_some() || series_uid.is_some() {
        return Err("patient=/series= were provided without server= URL.".to_string());
    }

    if raw_paths.is_empty() {
        return Err(
            "No DICOM path found in URL. Use path=..., file=..., paths=..., or files=..."
                .to_string(),
        );
    }

    Ok(ViewerPayload::LocalPaths(
        raw_paths.into_iter().map(PathBuf::from).collect(),
    ))
}

fn is_quadra_uri(value: &str) -> bool {
    strip_quadra_scheme(value).is_some()
}

fn strip_quadra_scheme(uri: &str) -> Option<&str> {
    let prefix = "quadra://";
    if uri.len() >= prefix.len() && uri[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&uri[prefix.len()..])
    } else {
        None
    }
}

fn split_location_and_query(value: &str) -> (&str, Option<&str>) {
    if let Some((location, query)) = value.split_once('?') {
        (location, Some(query))
    } else {
        (value, None)
    }
}

fn parse_location_path(location: &str) -> Result<Option<String>, String> {
    let location = location.trim();
    if location.is_empty() || location == "/" {
        return Ok(None);
    }

    let lower = location.to_ascii_lowercase();
    if lower == "open" {
        return Ok(None);
    }

    if lower.starts_with("open/") {
        let candidate = &location[5..];
        let decoded = percent_decode(candidate)?;
        if decoded.trim().is_empty() {
            return Ok(None);
        }
        return Ok(Some(decoded));
    }

    Ok(Some(percent_decode(location)?))
}

fn split_path_list(value: &str) -> Vec<&str> {
    if value.contains('|') {
        value.split('|').collect()
    } else {
        value.split(',').collect()
    }
}

fn percent_decode(value: &str) -> Result<String, String> {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                decoded.push(b' ');
                index += 1;
            }
            b'%' => {
                if index + 2 >= bytes.len() {
                    return Err("Invalid percent-encoding in URL.".to_string());
                }
                let hi = decode_hex_digit(bytes[index + 1])
                    .ok_or_else(|| "Invalid percent-encoding in URL.".to_string())?;
                let lo = decode_hex_digit(bytes[index + 2])
                    .ok_or_else(|| "Invalid percent-encoding in URL.".to_string())?;
                decoded.push((hi << 4) | lo);
                index += 3;
            }
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }

    String::from_utf8(decoded).map_err(|_| "URL contains invalid UTF-8 after decoding.".to_string())
}

fn decode_hex_digit(value: u8) -> Option<u8> {
    match value {
        b'0'..=b'9' => Some(value - b'0'),
        b'a'..=b'f' => Some(value - b'a' + 10),
        b'A'..=b'F' => Some(value - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_path_query() {
        let payload =
            parse_quadra_uri("quadra://open?path=example-data%2Fa.dcm").expect("URI should parse");
        assert_eq!(
            payload,
            ViewerPayload::LocalPaths(vec![PathBuf::from("example-data/a.dcm")])
        );
    }

    #[test]
    fn parse_repeated_path_params() {
        let payload = parse_quadra_uri(
            "quadra://open?path=example-data%2Fa.dcm&path=example-data%2Fb.dcm",
        )
        .expect("URI should parse");
        assert_eq!(
            payload,
            ViewerPayload::LocalPaths(vec![
                PathBuf::from("example-data/a.dcm"),
                PathBuf::from("example-data/b.dcm"),
            ])
        );
    }

    #[test]
    fn parse_grouped_local_request() {
        let payload = parse_quadra_uri(
            "quadra://open?group=example-data%2Fa.dcm|example-data%2Fb.dcm&group=example-data%2Fc.dcm",
        )
        .expect("URI should parse");
        assert_eq!(
            payload,
            ViewerPayload::LocalGroups {
                groups: vec![
                    vec![
                        PathBuf::from("example-data/a.dcm"),
                        PathBuf::from("example-data/b.dcm"),
                    ],
                    vec![PathBuf::from("example-data/c.dcm")],
                ],
            }
        );
    }

    #[test]
    fn parse_study_request() {
        let payload = parse_quadra_uri(
            "quadra://open?server=http%3A%2F%2Flocalhost%3A8080%2Fapi&patient=patient_alpha&series=series_uid_beta",
        )
        .expect("URI should parse");
        assert_eq!(
            payload,
            ViewerPayload::Study {
                base_url: "http://localhost:8080/api".to_string(),
                patient_id: "patient_alpha".to_string(),
                series_uid: Some("series_uid_beta".to_string()),
            }
        );
    }

    #[test]
    fn parse_study_requires_patient() {
        let error = parse_quadra_uri("quadra://open?server=http%3A%2F%2Flocalhost%3A8080")
            .expect_err("URI should fail");
        assert!(error.contains("requires 'patient'"));
    }

    #[test]
    fn parse_rejects_mixed_local_and_server() {
        let error = parse_quadra_uri(
            "quadra://open?path=a.dcm&server=http%3A%2F%2Flocalhost%3A8080&patient=p",
        )
        .expect_err("URI should fail");
        assert!(error.contains("Cannot mix server="));
    }

    #[test]
    fn parse_cli_falls_back_to_raw_paths() {
        let args = vec!["a.dcm".to_string(), "b.dcm".to_string()];
        let parsed = parse_payload_from_args(&args).expect("args should parse");
        assert_eq!(
            parsed,
            Some(ViewerPayload::LocalPaths(vec![
                PathBuf::from("a.dcm"),
                PathBuf::from("b.dcm"),
            ]))
        );
    }

    #[test]
    fn parse_cli_open_flag_requires_paths() {
        let error = parse_payload_from_args(&["--open".to_string()])
            .expect_err("bare --open should fail");
        assert!(error.contains("Missing file path"));
    }
}
