// Compiles the operation-event RPC definition. A vendored protoc is used when
// PROTOC is not set so builds do not depend on a system install.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        // SAFETY: build scripts are single-threaded at this point.
        unsafe {
            std::env::set_var("PROTOC", protoc);
        }
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/eventlog.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/eventlog.proto");
    Ok(())
}
