fn main() -> Result<(), Box<dyn std::error::Error>> {
    // protox compiles the descriptor set in-process so the build does not
    // depend on a system protoc.
    let file_descriptors = protox::compile(["proto/rqd.proto"], ["proto"])?;
    tonic_build::configure()
        .build_client(false)
        .build_server(true)
        .compile_fds(file_descriptors)?;
    println!("cargo:rerun-if-changed=proto/rqd.proto");
    Ok(())
}
