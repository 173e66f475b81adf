use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/index");

    let commit = cmd("git", &["rev-parse", "--short=8", "HEAD"]);
    println!("cargo:rustc-env=SORTIE_GIT_COMMIT={commit}");

    let status = cmd("git", &["status", "--porcelain"]);
    let dirty = if status.is_empty() || status == "unknown" {
        ""
    } else {
        "-dirty"
    };
    println!("cargo:rustc-env=SORTIE_GIT_DIRTY={dirty}");

    let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    println!("cargo:rustc-env=SORTIE_BUILD_TIME={now}");
}

/// Trimmed stdout, or "unknown" when the command cannot run.
fn cmd(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".into())
}
