//! 版本信息 - 构建期由 vergen 注入

/// SDK 版本号
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 构建时的 git commit（非 git 环境下为占位值）
pub const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

/// 构建时间戳
pub const BUILD_TIME: &str = match option_env!("VERGEN_BUILD_TIMESTAMP") {
    Some(timestamp) => timestamp,
    None => "unknown",
};

/// 完整版本描述
pub fn full_version() -> String {
    format!("{} ({} {})", SDK_VERSION, GIT_SHA, BUILD_TIME)
}
