use assetfetch_core::throttle::DestinationKey;
use clap::Args;

#[derive(Args)]
pub struct KeyArgs {
    /// Locators (URLs or bare host[:port][/path])
    #[arg(required = true)]
    pub locators: Vec<String>,
}

pub fn cmd_key(args: &KeyArgs) {
    for locator in &args.locators {
        let key = DestinationKey::from_locator(locator);
        if key.is_empty() {
            println!("{locator}\t-");
        } else {
            println!("{locator}\t{key}");
        }
    }
}
