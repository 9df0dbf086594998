fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_root = "proto";
    let api_proto = format!("{proto_root}/deviceplugin/v1beta1/api.proto");

    println!("cargo:rerun-if-changed={api_proto}");
    println!("cargo:rerun-if-env-changed=PPU_PLUGIN_REGEN_PROTO");

    // The checked-in stubs under src/generated are used unless a
    // regeneration is requested explicitly (needs protoc on PATH).
    if std::env::var_os("PPU_PLUGIN_REGEN_PROTO").is_none() {
        return Ok(());
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir("src/generated")
        .compile_protos(&[&api_proto], &[proto_root])?;

    Ok(())
}
