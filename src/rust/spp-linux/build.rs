//! spp-session ビルドスクリプト

use chrono::Utc;
use std::env;

fn main() {
    // ビルド時刻を環境変数として設定
    let build_time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    println!("cargo:rustc-env=BUILD_TIME={}", build_time);

    // Gitコミットハッシュを取得（可能な場合）
    let git_hash = std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=GIT_HASH={}", git_hash);

    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=BUILD_PROFILE={}", profile);

    // ビルド番号をタイムスタンプ形式（YYMMDDHHmmss）で生成
    let build_number = env::var("BUILD_NUMBER")
        .unwrap_or_else(|_| Utc::now().format("%y%m%d%H%M%S").to_string());
    println!("cargo:rustc-env=BUILD_NUMBER={}", build_number);

    // 再ビルドのトリガー
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=BUILD_NUMBER");
}
