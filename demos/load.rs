use std::env;

use obj_loader::LoadedObject;

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .format_timestamp(None)
        .init();

    let mut args = env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("Usage: load <object file> [symbol...]");
        std::process::exit(1);
    };

    let obj = match LoadedObject::open(&path) {
        Ok(obj) => obj,
        Err(_) => {
            eprintln!("Error: {}", obj_loader::last_error());
            std::process::exit(1);
        }
    };

    let range = obj.image_range();
    println!("{}: image at {:#x}-{:#x}", path, range.start, range.end);
    for (name, addr) in obj.symbols() {
        println!("  {:p} {}", addr, name);
    }

    for name in args {
        match obj.sym(&name) {
            Some(addr) => println!("{} => {:p}", name, addr),
            None => println!("{} => not found", name),
        }
    }
}
