fn main() -> Result<(), Box<dyn std::error::Error>> {
    // kubelet device plugin API: we serve DevicePlugin and call Registration
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/api.proto"], &["proto"])?;
    Ok(())
}
