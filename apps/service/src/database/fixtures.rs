use super::models::NewTarget;

/// The bootstrap target set used by demo and test environments.
///
/// Six rows spanning enabled/disabled and several intervals so every
/// registry path has something to return. Only the last two are enabled.
pub fn reference_targets(base_url: &str) -> Vec<NewTarget> {
    let url = base_url.trim_end_matches('/');
    vec![
        NewTarget::new(url),
        NewTarget::new(format!("{url}/sleep")),
        NewTarget::new(format!("{url}/sleep/1")).every(10),
        NewTarget::new(format!("{url}/sleep/1/25")).every(5),
        NewTarget::new(format!("{url}/sleep/1")).enabled(true).every(2).matching("SUCCESSFUL"),
        NewTarget::new(format!("{url}/sleep/1/25")).enabled(true).every(1).matching("SKIPPED"),
    ]
}
