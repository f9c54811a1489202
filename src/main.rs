mod app;
mod coordinator;
mod engine;
mod launch;
mod render;
mod resolve;
mod selection;
mod session;
mod thumbs;

fn main() -> eframe::Result<()> {
    env_logger::init();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let (initial_payload, initial_status) = match launch::parse_payload_from_args(&cli_args) {
        Ok(payload) => (payload, None),
        Err(err) => (None, Some(format!("Launch URL/args error: {err}"))),
    };

    let native_options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_inner_size([1280.0, 820.0])
            .with_resizable(true),
        ..Default::default()
    };

    eframe::run_native(
        "Quadra Viewer",
        native_options,
        Box::new(move |_cc| {
            Ok(Box::new(app::QuadraApp::new(
                initial_payload.clone(),
                initial_status.clone(),
            )))
        }),
    )
}
