fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR")?;
    let out_dir = std::env::var("OUT_DIR")?;
    let proto_dir = format!("{manifest_dir}/proto");
    let proto_path = format!("{proto_dir}/csi.proto");
    let descriptor_path = format!("{out_dir}/csi_descriptor.bin");

    println!("cargo:rerun-if-changed={proto_path}");

    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .file_descriptor_set_path(&descriptor_path)
        .compile_protos(&[proto_path], &[proto_dir])?;
    Ok(())
}
