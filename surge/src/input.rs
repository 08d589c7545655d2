use std::io::Read as _;
use std::sync::Arc;

use anyhow::Context as _;

use surge_core::Runner;
use surge_core::source::{
    CMDLINE_SENTINEL, STDIN_SENTINEL, SourceData, SourceKind, SourceType, looks_like_url,
};
use surge_metrics::Registry;

use crate::collector;
use crate::runner::{script::LuaRunner, url::UrlRunner};

/// Resolve the positional target into source data, per the `--type` flag.
///
/// `auto` tries URL first, then a file, then inline script code; content
/// read from stdin or a file goes through the URL-vs-script heuristic
/// again, since the argument itself said nothing about it.
pub fn resolve_source(arg: &str, requested: SourceType) -> anyhow::Result<SourceData> {
    if arg == "-" {
        let mut data = Vec::new();
        std::io::stdin()
            .read_to_end(&mut data)
            .context("failed to read stdin")?;
        return Ok(finish(data, STDIN_SENTINEL.to_string(), requested));
    }

    match requested {
        SourceType::Auto => {
            if looks_like_url(arg.as_bytes()) {
                return Ok(SourceData {
                    data: arg.as_bytes().to_vec(),
                    filename: CMDLINE_SENTINEL.to_string(),
                    kind: SourceKind::Url,
                });
            }
            match std::fs::read(arg) {
                Ok(data) => Ok(finish(data, arg.to_string(), SourceType::Auto)),
                // Not a URL and not a readable file: treat as inline script.
                Err(_) => Ok(SourceData {
                    data: arg.as_bytes().to_vec(),
                    filename: CMDLINE_SENTINEL.to_string(),
                    kind: SourceKind::Script,
                }),
            }
        }
        SourceType::Url => {
            if looks_like_url(arg.as_bytes()) {
                return Ok(SourceData {
                    data: arg.as_bytes().to_vec(),
                    filename: CMDLINE_SENTINEL.to_string(),
                    kind: SourceKind::Url,
                });
            }
            // A file containing a URL.
            let data = std::fs::read(arg).with_context(|| format!("failed to read {arg}"))?;
            Ok(SourceData {
                data,
                filename: arg.to_string(),
                kind: SourceKind::Url,
            })
        }
        SourceType::Script => match std::fs::read(arg) {
            Ok(data) => Ok(SourceData {
                data,
                filename: arg.to_string(),
                kind: SourceKind::Script,
            }),
            // Fall back to treating the argument itself as script code.
            Err(_) => Ok(SourceData {
                data: arg.as_bytes().to_vec(),
                filename: CMDLINE_SENTINEL.to_string(),
                kind: SourceKind::Script,
            }),
        },
    }
}

fn finish(data: Vec<u8>, filename: String, requested: SourceType) -> SourceData {
    let kind = match requested {
        SourceType::Url => SourceKind::Url,
        SourceType::Script => SourceKind::Script,
        SourceType::Auto => {
            if looks_like_url(&data) {
                SourceKind::Url
            } else {
                SourceKind::Script
            }
        }
    };
    SourceData {
        data,
        filename,
        kind,
    }
}

pub async fn make_runner(
    src: &SourceData,
    registry: Arc<Registry>,
) -> anyhow::Result<Arc<dyn Runner>> {
    match src.kind {
        SourceKind::Url => {
            let url = src.data_str();
            let runner = UrlRunner::new(url.trim(), &registry)
                .with_context(|| format!("failed to create a runner for {}", url.trim()))?;
            Ok(Arc::new(runner))
        }
        SourceKind::Script => {
            let runner = LuaRunner::new(src, registry)
                .await
                .with_context(|| format!("failed to load script {}", src.filename))?;
            Ok(Arc::new(runner))
        }
    }
}

pub fn make_collector(
    out: &str,
    registry: Arc<Registry>,
) -> anyhow::Result<Box<dyn surge_core::Collector>> {
    let (kind, destination) = parse_collector_string(out)?;
    match kind {
        "influxdb" => Ok(Box::new(collector::influxdb::InfluxdbCollector::new(
            destination,
            registry,
        )?)),
        "json" => Ok(Box::new(collector::json::JsonCollector::new(
            destination,
            registry,
        ))),
        other => anyhow::bail!("unknown output type: {other}"),
    }
}

pub fn parse_collector_string(s: &str) -> anyhow::Result<(&str, &str)> {
    s.split_once('=')
        .context("malformed output; must be in the form 'kind=destination'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn auto_resolves_urls_from_the_argument() {
        let src = resolve_source("https://example.test/", SourceType::Auto).unwrap();
        assert_eq!(src.kind, SourceKind::Url);
        assert_eq!(src.filename, CMDLINE_SENTINEL);
    }

    #[test]
    fn auto_resolves_script_files_by_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "check('ok', true)").unwrap();

        let path = file.path().to_str().unwrap();
        let src = resolve_source(path, SourceType::Auto).unwrap();
        assert_eq!(src.kind, SourceKind::Script);
        assert_eq!(src.filename, path);
    }

    #[test]
    fn auto_resolves_url_files_by_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "http://localhost:8080/").unwrap();

        let src = resolve_source(file.path().to_str().unwrap(), SourceType::Auto).unwrap();
        assert_eq!(src.kind, SourceKind::Url);
    }

    #[test]
    fn auto_falls_back_to_inline_script() {
        let src = resolve_source("check('ok', 1 == 1)", SourceType::Auto).unwrap();
        assert_eq!(src.kind, SourceKind::Script);
        assert_eq!(src.filename, CMDLINE_SENTINEL);
    }

    #[test]
    fn url_type_requires_a_url_or_readable_file() {
        let src = resolve_source("http://localhost/", SourceType::Url).unwrap();
        assert_eq!(src.kind, SourceKind::Url);

        assert!(resolve_source("./definitely-missing-file", SourceType::Url).is_err());
    }

    #[test]
    fn script_type_prefers_files_then_inline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sleep(0.1)").unwrap();

        let src = resolve_source(file.path().to_str().unwrap(), SourceType::Script).unwrap();
        assert_eq!(src.kind, SourceKind::Script);
        assert!(src.data_str().contains("sleep"));

        let src = resolve_source("sleep(0.1)", SourceType::Script).unwrap();
        assert_eq!(src.filename, CMDLINE_SENTINEL);
    }

    #[test]
    fn collector_strings_split_on_the_first_equals() {
        assert_eq!(
            parse_collector_string("json=out=x.ndjson").unwrap(),
            ("json", "out=x.ndjson")
        );
        assert!(parse_collector_string("json").is_err());
    }
}
