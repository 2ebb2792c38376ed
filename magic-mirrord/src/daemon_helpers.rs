fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn parse_resource_types(value: &str) -> Vec<String> {
    let mut types: Vec<String> = Vec::new();
    for kind in value.split(',').map(str::trim).filter(|kind| !kind.is_empty()) {
        if !types.iter().any(|known| known == kind) {
            types.push(kind.to_string());
        }
    }
    types
}

/// Seconds between polls; `0` turns polling off.
fn parse_poll_interval(
    value: Option<&str>,
    default_secs: u64,
) -> anyhow::Result<Option<Duration>> {
    let secs = match value {
        Some(value) => value
            .parse::<u64>()
            .with_context(|| format!("{value:?} is not a number of seconds"))?,
        None => default_secs,
    };
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}
