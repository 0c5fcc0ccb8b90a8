use std::{env::args, fs::File, io::Read};

use anyhow::{bail, Result};

use pickle_loader as pl;

fn main() -> Result<()> {
    let mut fname = None;
    let mut numeric = false;
    let mut compat = false;
    for arg in args().skip(1) {
        match arg.as_str() {
            "--numeric" => numeric = true,
            "--compat" => compat = true,
            _ => fname = Some(arg),
        }
    }
    let mut fp = if let Some(fname) = fname {
        println!("* Dumping: {fname}\n");
        File::open(fname)?
    } else {
        bail!("Specify pickle filename! [--numeric] [--compat]");
    };
    let mut buf = Vec::with_capacity(fp.metadata().map(|md| md.len() as usize).unwrap_or(16384));
    let _ = fp.read_to_end(&mut buf)?;

    let mut up = pl::Unpickler::new(&buf);
    up.env_mut().set(pl::factory::SUPPORTS_NUMERIC, numeric);
    up.env_mut().set(pl::factory::COMPATIBILITY, compat);
    match up.loads() {
        Ok(val) => println!("{val}"),
        Err(e) => println!("ERROR: {e}"),
    }
    Ok(())
}
