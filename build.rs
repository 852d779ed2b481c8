fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only rerun if proto files change
    println!("cargo:rerun-if-changed=proto/audit/audit.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/audit/audit.proto"], &["proto"])?;
    Ok(())
}
