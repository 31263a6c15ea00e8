use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` is honoured; `debug` raises this crate and plugin output to
/// debug on top of it.
pub fn init(debug: bool, json: bool) {
    let level = if debug { "debug" } else { "info" };
    let mut filter = EnvFilter::from_default_env();
    for directive in [format!("stucco_host={level}"), format!("plugin={level}")] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("logging already initialised: {e}");
    }
}
