fn main() {
    if let Err(e) = erx_pipeline::run() {
        eprintln!("erx-pipeline: {e}");
        std::process::exit(1);
    }
}
