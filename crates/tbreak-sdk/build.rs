use vergen::EmitBuilder;

fn main() {
    // 注入构建时间与 git commit；失败时 version.rs 回退到占位值
    let _ = EmitBuilder::builder()
        .build_timestamp()
        .git_sha(false)
        .emit();
}
