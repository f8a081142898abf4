#[rocket::launch]
fn rocket() -> _ {
    chain_import::init_logger();
    log::info!("starting chain import server");
    chain_import::rocket()
}
