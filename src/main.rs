use docker_image_sync::cli::{Args, Runner};

#[tokio::main]
async fn main() {
    let args = Args::parse_args();

    let runner = match Runner::new(args) {
        Ok(runner) => runner,
        Err(err) => {
            eprintln!("Error: {}", err.chain());
            std::process::exit(1);
        }
    };

    if let Err(err) = runner.run().await {
        runner.logger().error(&err.chain());
        std::process::exit(1);
    }
}
