use std::process::{Command, Stdio};

fn git_commit() -> Option<String> {
    let cmd = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .stderr(Stdio::null())
        .output()
        .ok()?;

    if !cmd.status.success() {
        return None;
    }

    Some(String::from_utf8_lossy(&cmd.stdout).trim().to_owned())
}

fn main() {
    let commit = git_commit().unwrap_or_else(|| "unknown".to_owned());
    println!("cargo:rustc-env=CORESTASH_GIT_COMMIT={commit}");
    println!("cargo:rerun-if-env-changed=CORESTASH_GIT_COMMIT");

    let built_at = chrono::Utc::now().to_rfc3339();
    println!("cargo:rustc-env=CORESTASH_BUILT_AT={built_at}");
}
