use staffetta::{ClientConfig, ServiceName};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let service = ServiceName::new("pkg.Tester")?;

    // The typed configuration is only turned into the JSON service-config
    // document at the boundary, e.g. to hand it to another stack or to
    // persist it alongside deployment manifests.
    let config = ClientConfig::recommended(&service);
    config.validate()?;

    println!("{}", config.to_json()?);

    Ok(())
}
