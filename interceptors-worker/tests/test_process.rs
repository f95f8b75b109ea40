use std::process::{Command, Output};

fn run_worker_with(var: &str, value: &str) -> Output {
    Command::new(env!("CARGO_BIN_EXE_interceptors-worker"))
        .env(var, value)
        .env("EXPORT_PROMETHEUS", "false")
        .env("START_EXAMPLE_WORKFLOW", "false")
        .output()
        .expect("failed to launch the worker binary")
}

#[test]
fn invalid_configuration_exits_with_failure() {
    for (var, value) in [("BIND_PORT", "notaport"), ("SERVICE_NAME", "")] {
        let output = run_worker_with(var, value);
        let stderr = String::from_utf8_lossy(&output.stderr);

        assert_eq!(output.status.code(), Some(1), "{var}={value:?}: {stderr}");
        assert!(stderr.contains("invalid configuration"), "{stderr}");
        assert!(stderr.contains(var), "{stderr}");
    }
}
