use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive used when `RUST_LOG` is not set.
fn default_directive(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    // The codec traces every frame.
    format!(
        "perfnum={level},manage={level},compute={level},report={level},perfnum::bridge::codec=off",
        level = level
    )
}

fn filter_from_env() -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(default_directive(std::env::var("PERFNUM_LOG").ok().as_deref())),
    }
}

fn wants_json(log_format: Option<&str>) -> bool {
    log_format.is_some_and(|f| f.eq_ignore_ascii_case("json"))
}

/// Install the global subscriber for a perfnum binary.
///
/// Output always goes to stderr: pipe workers write packets to stdout and the
/// monitor prints results there. `RUST_LOG` takes precedence over
/// `PERFNUM_LOG`; `LOG_FORMAT=json` switches to JSON lines. Calling it twice is
/// harmless.
pub fn init_tracing() {
    let json = wants_json(std::env::var("LOG_FORMAT").ok().as_deref());

    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!json).then(|| fmt::layer().with_writer(std::io::stderr));

    let _ = tracing_subscriber::registry()
        .with(filter_from_env())
        .with(json_layer)
        .with(text_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        insta::assert_snapshot!(
            default_directive(None),
            @"perfnum=info,manage=info,compute=info,report=info,perfnum::bridge::codec=off"
        );
        assert!(default_directive(Some("warning")).starts_with("perfnum=warn,"));
        assert!(default_directive(Some("debug")).starts_with("perfnum=debug,"));
        assert!(default_directive(Some("bogus")).starts_with("perfnum=info,"));
    }

    #[test]
    fn json_format_selection() {
        assert!(wants_json(Some("json")));
        assert!(wants_json(Some("JSON")));
        assert!(!wants_json(Some("text")));
        assert!(!wants_json(None));
    }
}
