use anyhow::Result;
use base64::Engine;
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use edgeguard_auth::keys::KEY_SIZE;

use crate::cli::{KeyEncoding, KeygenArgs};

/// Random bytes behind the admin secret; hex-encoded to 48 characters.
const ADMIN_SECRET_BYTES: usize = 24;

pub fn run(args: &KeygenArgs) -> Result<()> {
    let block = render_secrets(args.encoding, !args.no_admin);
    println!("{}", block.as_str());
    tracing::debug!(encoding = ?args.encoding, "Generated secrets");
    Ok(())
}

/// Renders a fresh `[secrets]` section.
fn render_secrets(encoding: KeyEncoding, with_admin: bool) -> Zeroizing<String> {
    let root_key = random_key(encoding);
    let lookup_key = random_key(encoding);

    let mut block = Zeroizing::new(String::from("[secrets]\n"));
    block.push_str(&format!("root_key = \"{}\"\n", root_key.as_str()));
    block.push_str(&format!("lookup_key = \"{}\"\n", lookup_key.as_str()));

    if with_admin {
        let mut bytes = Zeroizing::new([0u8; ADMIN_SECRET_BYTES]);
        OsRng.fill_bytes(bytes.as_mut_slice());
        block.push_str(&format!("admin_secret = \"{}\"\n", hex::encode(bytes.as_slice())));
    }

    block
}

fn random_key(encoding: KeyEncoding) -> Zeroizing<String> {
    let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(bytes.as_mut_slice());
    Zeroizing::new(match encoding {
        KeyEncoding::Hex => hex::encode(bytes.as_slice()),
        KeyEncoding::Base64 => base64::engine::general_purpose::STANDARD.encode(bytes.as_slice()),
    })
}
