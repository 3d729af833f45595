use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use comanda_core::printer::{ReceiptItem, NARROW_WIDTH};
use comanda_core::store::Record;
use comanda_core::{NetworkPrinter, PermissionGate, PrintEvent, PrintQueue, Receipt};

use super::{block_on, CommandError};
use crate::config::Config;

/// Print a test receipt
#[derive(Args)]
pub struct PrintTestCommand {
    /// Printer as "host" or "host:port"; defaults to printer.device
    #[arg(long, short)]
    device: Option<String>,

    /// Order record as JSON; a sample order when omitted
    #[arg(long)]
    order: Option<String>,

    /// Paper width in columns
    #[arg(long)]
    width: Option<usize>,

    /// Write the raw receipt bytes to a file instead of printing
    #[arg(long, short)]
    output: Option<PathBuf>,
}

impl PrintTestCommand {
    pub fn run(&self, config: &Config) -> Result<(), CommandError> {
        let width = self
            .width
            .or(config.printer.width)
            .unwrap_or(NARROW_WIDTH);
        let receipt = self.receipt()?.with_width(width);

        if let Some(path) = &self.output {
            std::fs::write(path, receipt.render()).map_err(CommandError::RuntimeError)?;
            println!("Wrote {} to {}", receipt.summary(), path.display());
            return Ok(());
        }

        let device = self
            .device
            .clone()
            .or_else(|| config.printer.device.clone())
            .ok_or_else(|| {
                CommandError::InvalidInput(
                    "No printer configured. Pass --device or set printer.device.".to_string(),
                )
            })?;
        let printer = NetworkPrinter::at(&device)?;

        block_on(async move {
            let (queue, mut events) = PrintQueue::spawn(printer, PermissionGate::granted());
            queue.enqueue(receipt, Vec::new())?;

            match tokio::time::timeout(Duration::from_secs(30), events.recv()).await {
                Ok(Some(PrintEvent::Printed { .. })) => {
                    println!("Printed test receipt on {}", device);
                    Ok(())
                }
                Ok(Some(PrintEvent::Failed { error, .. })) => {
                    Err(CommandError::InvalidInput(format!("Print failed: {}", error)))
                }
                Ok(None) | Err(_) => Err(CommandError::InvalidInput(
                    "Printer did not finish in time".to_string(),
                )),
            }
        })
    }

    fn receipt(&self) -> Result<Receipt, CommandError> {
        let Some(raw) = &self.order else {
            return Ok(sample_receipt());
        };
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| CommandError::InvalidInput(format!("Invalid order JSON: {}", e)))?;
        let record = Record::from_value(value).ok_or_else(|| {
            CommandError::InvalidInput("Order must be a JSON object".to_string())
        })?;
        let receipt = Receipt::from_record(&record);
        if receipt.is_empty() {
            return Err(CommandError::InvalidInput("Order has no items".to_string()));
        }
        Ok(receipt)
    }
}

fn sample_receipt() -> Receipt {
    let mut receipt = Receipt::new(vec![
        ReceiptItem::new("X-Burger", 2)
            .with_options("Ponto: Ao ponto | Adicionais: Bacon, Ovo")
            .with_note("sem cebola"),
        ReceiptItem::new("Suco de laranja", 1),
    ])
    .with_table("Teste");
    receipt.title = "Teste de impressão".to_string();
    receipt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(order: Option<&str>) -> PrintTestCommand {
        PrintTestCommand {
            device: None,
            order: order.map(str::to_string),
            width: None,
            output: None,
        }
    }

    #[test]
    fn test_sample_receipt() {
        let receipt = command(None).receipt().unwrap();
        assert_eq!(receipt.summary(), "2x X-Burger, 1x Suco de laranja");
    }

    #[test]
    fn test_receipt_from_order() {
        let receipt = command(Some(r#"{"id": 1, "mesa": "4", "pedido": "Pizza"}"#))
            .receipt()
            .unwrap();
        assert_eq!(receipt.table, "4");
        assert!(command(Some(r#"{"id": 1}"#)).receipt().is_err());
        assert!(command(Some("[1]")).receipt().is_err());
    }

    #[test]
    fn test_output_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(temp_dir.path().join("none.yaml"))).unwrap();
        let path = temp_dir.path().join("receipt.bin");
        let cmd = PrintTestCommand {
            output: Some(path.clone()),
            ..command(None)
        };
        cmd.run(&config).unwrap();
        let bytes = std::fs::read(path).unwrap();
        assert!(bytes.starts_with(b"\x1b@"));
    }
}
