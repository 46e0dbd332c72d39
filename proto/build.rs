fn get_env(key: &str) -> Option<std::ffi::OsString> {
    println!("cargo:rerun-if-env-changed={}", key);
    std::env::var_os(key)
}

const PROTOS: &[&str] = &["addax/remote/v1/remote_cache.proto"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Prefer an explicitly configured protoc, fall back to the vendored one.
    if get_env("PROTOC").is_none() {
        match protoc_bin_vendored::protoc_bin_path() {
            Ok(protoc) => std::env::set_var("PROTOC", protoc),
            Err(e) => println!("cargo:warning=No vendored protoc available: {e:?}"),
        }
    }

    for proto in PROTOS {
        println!("cargo:rerun-if-changed={}", proto);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(PROTOS, &["."])?;
    Ok(())
}
