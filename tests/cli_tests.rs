use assert_cmd::prelude::*;
use std::fs;
use std::process::Command;

const GRAPH: &str = r#"
vertices:
  - id: start
    action: start
    time: 0
    serverport: 9723
    peers: 127.0.0.1:9723
  - id: fetch
    action: transfer
    type: get
    protocol: tcp
    size: 1 KiB
  - id: done
    action: end
    count: 2
edges:
  - [start, fetch]
  - [fetch, done]
"#;

#[test]
fn runs_a_minimal_graph_to_completion() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::temp_dir().join("tgen-cli-test.yaml");
    fs::write(&path, GRAPH)?;

    let mut cmd = Command::cargo_bin("tgen")?;
    cmd.arg(&path).arg("--seed").arg("0");
    cmd.assert().success();

    fs::remove_file(path)?;
    Ok(())
}

#[test]
fn invalid_graph_exits_with_code_1() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::temp_dir().join("tgen-cli-invalid.yaml");
    fs::write(&path, "vertices: []\n")?;

    let mut cmd = Command::cargo_bin("tgen")?;
    cmd.arg(&path);
    cmd.assert().failure().code(1);

    fs::remove_file(path)?;
    Ok(())
}
