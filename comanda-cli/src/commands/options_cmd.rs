use clap::{Args, Subcommand};
use comanda_core::options::{normalize, parse_str, OptionsDocument};
use std::io::{self, Read};

/// Inspect and normalize item options documents
#[derive(Args)]
pub struct OptionsCommand {
    #[command(subcommand)]
    command: OptionsSubcommand,
}

#[derive(Subcommand)]
enum OptionsSubcommand {
    /// Print the canonical form
    Canonicalize {
        /// Document text; read from stdin when omitted or "-"
        input: Option<String>,
    },

    /// Print a one-line summary, as on receipts
    Summary {
        /// Document text; read from stdin when omitted or "-"
        input: Option<String>,
    },

    /// Print each group and option with its values
    Show {
        /// Document text; read from stdin when omitted or "-"
        input: Option<String>,
    },
}

impl OptionsCommand {
    pub fn run(&self) -> Result<(), io::Error> {
        match &self.command {
            OptionsSubcommand::Canonicalize { input } => {
                println!("{}", load(input.as_deref())?.serialize());
            }
            OptionsSubcommand::Summary { input } => {
                println!("{}", load(input.as_deref())?.summary());
            }
            OptionsSubcommand::Show { input } => {
                let doc = load(input.as_deref())?;
                if doc.is_empty() {
                    println!("No option groups.");
                }
                for line in describe(&doc) {
                    println!("{}", line);
                }
            }
        }
        Ok(())
    }
}

fn load(input: Option<&str>) -> Result<OptionsDocument, io::Error> {
    let text = match input {
        Some(text) if text != "-" => text.to_string(),
        _ => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let parsed = parse_str(text.trim());
    if parsed.fallback_used {
        eprintln!("note: input was not strict JSON; read it with single quotes as double");
    }
    Ok(normalize(&parsed.groups))
}

fn describe(doc: &OptionsDocument) -> Vec<String> {
    let mut lines = Vec::new();
    for group in &doc.groups {
        let name = if group.name.is_empty() {
            "(unnamed)"
        } else {
            group.name.as_str()
        };
        lines.push(format!(
            "{} [max {}{}]",
            name,
            group.max_selected,
            if group.required { ", required" } else { "" }
        ));
        for option in &group.options {
            let mut line = format!("  - {}", option.name);
            if option.extra_value != 0.0 {
                line.push_str(&format!(" (+{:.2})", option.extra_value));
            }
            if option.depleted {
                line.push_str(" [esgotado]");
            }
            lines.push(line);
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_single_quoted() {
        let doc = load(Some("[{'nome':'Tamanho','options':[{'nome':'G','valor_extra':'2,5'}]}]")).unwrap();
        assert_eq!(doc.summary(), "Tamanho: G");
        assert_eq!(
            doc.serialize(),
            r#"[{"nome":"Tamanho","ids":"","max_selected":1,"obrigatorio":0,"options":[{"nome":"G","valor_extra":2.5,"esgotado":0}]}]"#
        );
    }

    #[test]
    fn test_describe() {
        let doc = load(Some(
            r#"[{"nome":"Adicionais","obrigatorio":1,"max_selected":2,"options":[{"nome":"Bacon","valor_extra":3,"esgotado":1}]}]"#,
        ))
        .unwrap();
        assert_eq!(
            describe(&doc),
            vec![
                "Adicionais [max 2, required]".to_string(),
                "  - Bacon (+3.00) [esgotado]".to_string(),
            ]
        );
    }
}
