//! plcvm-asm: assemble PLCVM assembly into a PLCM module.
//!
//! ```text
//! plcvm-asm input.asm                  # writes input.plcm
//! plcvm-asm input.asm -o prog.plcm
//! plcvm-asm input.asm --raw -o prog.bin  # raw bytecode, no container
//! plcvm-asm input.asm --disasm --hex
//! ```

use std::env;
use std::path::PathBuf;

use anyhow::Context;

use plcvm::asm;
use plcvm::module::Module;

fn usage() -> ! {
    eprintln!("Usage: plcvm-asm <input.asm> [-o <output>] [--raw] [--disasm] [--hex]");
    eprintln!();
    eprintln!("  -o <output>   Output file (default: input with .plcm or .bin extension)");
    eprintln!("  --raw         Write raw bytecode without the PLCM container");
    eprintln!("  --disasm      Print a disassembly of the generated code");
    eprintln!("  --hex         Print the generated code as a hex dump");
    std::process::exit(2);
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    let mut input: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;
    let mut raw = false;
    let mut disasm = false;
    let mut hex = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-o" | "--output" => {
                i += 1;
                if i >= args.len() {
                    usage();
                }
                output = Some(PathBuf::from(&args[i]));
            }
            "--raw" => raw = true,
            "--disasm" => disasm = true,
            "--hex" => hex = true,
            "-h" | "--help" => usage(),
            arg if arg.starts_with('-') => usage(),
            arg => {
                if input.is_some() {
                    usage();
                }
                input = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    let Some(input) = input else { usage() };
    let source = std::fs::read_to_string(&input)
        .with_context(|| format!("failed to read {}", input.display()))?;

    let program = match asm::assemble(&source) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("Assembly error: {e}");
            std::process::exit(1);
        }
    };

    let out_path =
        output.unwrap_or_else(|| input.with_extension(if raw { "bin" } else { "plcm" }));
    let bytes = if raw {
        program.code.clone()
    } else {
        Module::with_code(program.code.clone(), program.entry).encode()
    };
    std::fs::write(&out_path, &bytes)
        .with_context(|| format!("failed to write {}", out_path.display()))?;

    println!(
        "Assembled: {} -> {} ({} bytes)",
        input.display(),
        out_path.display(),
        bytes.len()
    );

    if disasm {
        println!();
        println!("Disassembly:");
        println!("{}", asm::disassemble(&program.code, 0));
    }

    if hex {
        println!();
        println!("Hex dump:");
        for (row, chunk) in program.code.chunks(16).enumerate() {
            let hex_str: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
            println!("0x{:04X}: {}", row * 16, hex_str.join(" "));
        }
    }

    Ok(())
}
